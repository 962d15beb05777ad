pub mod chat_event;

pub use chat_event::DomainEvent;
