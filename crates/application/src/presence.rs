//! 进程内在线状态注册表
//!
//! 维护 `UserId -> {状态, 连接集合}`。状态不持久化，进程重启后所有用户
//! 从离线开始。同一用户的注册和注销在同一把锁内完成，锁内不做任何 I/O。

use std::collections::{HashMap, HashSet};

use domain::{ConnectionId, PresenceStatus, UserId};
use parking_lot::Mutex;

/// 一次在线状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceTransition {
    pub user_id: UserId,
    pub previous: PresenceStatus,
    pub current: PresenceStatus,
}

#[derive(Debug, Default)]
struct PresenceEntry {
    status: PresenceStatus,
    connections: HashSet<ConnectionId>,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: Mutex<HashMap<UserId, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一条连接。连接集合由空变为非空时返回 online 变化。
    pub fn register(&self, user_id: UserId, connection_id: ConnectionId) -> Option<PresenceTransition> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(user_id).or_default();
        let was_empty = entry.connections.is_empty();
        entry.connections.insert(connection_id);

        if !was_empty {
            tracing::debug!(
                user_id = %user_id,
                connection_id = %connection_id,
                connections = entry.connections.len(),
                "用户新增连接"
            );
            return None;
        }

        let previous = entry.status;
        entry.status = PresenceStatus::Online;
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "用户上线");
        Some(PresenceTransition {
            user_id,
            previous,
            current: PresenceStatus::Online,
        })
    }

    /// 注销一条连接。最后一条连接关闭时返回 offline 变化；
    /// 未知连接或仍有其他连接时不产生变化。
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> Option<PresenceTransition> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&user_id)?;
        if !entry.connections.remove(&connection_id) {
            return None;
        }
        if !entry.connections.is_empty() {
            tracing::debug!(
                user_id = %user_id,
                connection_id = %connection_id,
                remaining = entry.connections.len(),
                "用户关闭一条连接"
            );
            return None;
        }

        let previous = entry.status;
        entries.remove(&user_id);
        tracing::info!(user_id = %user_id, "用户离线");
        Some(PresenceTransition {
            user_id,
            previous,
            current: PresenceStatus::Offline,
        })
    }

    /// 客户端显式设置 online/away。没有连接时忽略，offline 只能由
    /// 关闭最后一条连接得到。
    pub fn set_status(&self, user_id: UserId, status: PresenceStatus) -> Option<PresenceTransition> {
        if status == PresenceStatus::Offline {
            tracing::debug!(user_id = %user_id, "忽略客户端声明的 offline 状态");
            return None;
        }

        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&user_id)?;
        if entry.connections.is_empty() || entry.status == status {
            return None;
        }

        let previous = entry.status;
        entry.status = status;
        Some(PresenceTransition {
            user_id,
            previous,
            current: status,
        })
    }

    /// 用户当前所有连接，未知或离线用户返回空集合
    pub fn connections_for(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.entries
            .lock()
            .get(&user_id)
            .map(|entry| entry.connections.clone())
            .unwrap_or_default()
    }

    pub fn status_of(&self, user_id: UserId) -> PresenceStatus {
        self.entries
            .lock()
            .get(&user_id)
            .map(|entry| entry.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    /// 在锁内确认用户状态仍为 `status`，再把每位接收者的连接交给 `deliver`。
    /// 状态已被更新的变化返回 `None`，由更新后的那次变化负责通知。
    pub fn deliver_if_current<I, F>(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        recipients: I,
        mut deliver: F,
    ) -> Option<usize>
    where
        I: IntoIterator<Item = UserId>,
        F: FnMut(ConnectionId) -> bool,
    {
        let entries = self.entries.lock();
        let current = entries
            .get(&user_id)
            .map(|entry| entry.status)
            .unwrap_or(PresenceStatus::Offline);
        if current != status {
            return None;
        }

        let mut delivered = 0;
        for recipient in recipients {
            let Some(entry) = entries.get(&recipient) else {
                continue;
            };
            delivered += entry
                .connections
                .iter()
                .filter(|connection_id| deliver(**connection_id))
                .count();
        }
        Some(delivered)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.entries.lock().keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.connections.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_connection_brings_user_online() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();
        let conn = ConnectionId::generate();

        let transition = registry.register(user, conn).expect("transition");
        assert_eq!(transition.previous, PresenceStatus::Offline);
        assert_eq!(transition.current, PresenceStatus::Online);
        assert_eq!(registry.status_of(user), PresenceStatus::Online);
        assert!(registry.connections_for(user).contains(&conn));
    }

    #[test]
    fn second_device_does_not_transition() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();
        let (c1, c2) = (ConnectionId::generate(), ConnectionId::generate());

        assert!(registry.register(user, c1).is_some());
        assert!(registry.register(user, c2).is_none());
        assert_eq!(registry.connections_for(user).len(), 2);

        // 关闭其中一台设备仍然在线
        assert!(registry.unregister(user, c1).is_none());
        assert_eq!(registry.status_of(user), PresenceStatus::Online);

        let transition = registry.unregister(user, c2).expect("offline transition");
        assert_eq!(transition.current, PresenceStatus::Offline);
        assert_eq!(registry.status_of(user), PresenceStatus::Offline);
        assert!(registry.connections_for(user).is_empty());
    }

    #[test]
    fn offline_fires_exactly_once() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();
        let conn = ConnectionId::generate();

        registry.register(user, conn);
        assert!(registry.unregister(user, conn).is_some());
        assert!(registry.unregister(user, conn).is_none());
        assert!(registry.unregister(user, ConnectionId::generate()).is_none());
    }

    #[test]
    fn away_is_honored_only_while_connected() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();
        let (c1, c2) = (ConnectionId::generate(), ConnectionId::generate());

        // 没有连接时不能声明状态
        assert!(registry.set_status(user, PresenceStatus::Away).is_none());
        assert_eq!(registry.status_of(user), PresenceStatus::Offline);

        registry.register(user, c1);
        let transition = registry.set_status(user, PresenceStatus::Away).expect("away");
        assert_eq!(transition.previous, PresenceStatus::Online);
        assert_eq!(registry.status_of(user), PresenceStatus::Away);

        // 重复设置不算变化
        assert!(registry.set_status(user, PresenceStatus::Away).is_none());
        // 有连接时不能声明离线
        assert!(registry.set_status(user, PresenceStatus::Offline).is_none());

        // 新设备接入不会覆盖 away
        assert!(registry.register(user, c2).is_none());
        assert_eq!(registry.status_of(user), PresenceStatus::Away);

        registry.unregister(user, c1);
        let transition = registry.unregister(user, c2).expect("offline");
        assert_eq!(transition.previous, PresenceStatus::Away);
    }

    #[test]
    fn stale_status_is_not_delivered() {
        let registry = PresenceRegistry::new();
        let (user, friend) = (UserId::generate(), UserId::generate());
        let (c1, f1) = (ConnectionId::generate(), ConnectionId::generate());
        registry.register(friend, f1);

        registry.register(user, c1);
        let offline = registry.unregister(user, c1).expect("offline");
        registry.register(user, ConnectionId::generate());

        let mut seen = Vec::new();
        let stale = registry.deliver_if_current(user, offline.current, [friend], |connection_id| {
            seen.push(connection_id);
            true
        });
        assert_eq!(stale, None);
        assert!(seen.is_empty());

        let current = registry.deliver_if_current(user, PresenceStatus::Online, [user, friend], |connection_id| {
            seen.push(connection_id);
            true
        });
        assert_eq!(current, Some(2));
        assert!(seen.contains(&f1));
    }

    #[test]
    fn unknown_user_has_no_connections() {
        let registry = PresenceRegistry::new();
        assert!(registry.connections_for(UserId::generate()).is_empty());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn concurrent_register_unregister_is_consistent() {
        let registry = Arc::new(PresenceRegistry::new());
        let user = UserId::generate();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut onlines = 0;
                    let mut offlines = 0;
                    for _ in 0..200 {
                        let conn = ConnectionId::generate();
                        if registry.register(user, conn).is_some() {
                            onlines += 1;
                        }
                        if registry.unregister(user, conn).is_some() {
                            offlines += 1;
                        }
                    }
                    (onlines, offlines)
                })
            })
            .collect();

        let (mut onlines, mut offlines) = (0, 0);
        for handle in handles {
            let (on, off) = handle.join().unwrap();
            onlines += on;
            offlines += off;
        }

        // 每次上线都对应恰好一次离线
        assert_eq!(onlines, offlines);
        assert_eq!(registry.status_of(user), PresenceStatus::Offline);
        assert_eq!(registry.connection_count(), 0);
    }
}
