//! Workflow consumers: the command topics and their handlers.

mod handlers;
mod kafka;
mod messages;

pub use handlers::{CancelHandler, ConfirmHandler, OrderLine, ReserveHandler};
pub use kafka::{CommandConsumer, ConsumerError, MessageHandler};
pub use messages::{
    FailureKind, OrderCancelled, OrderConfirmed, ReserveReply, ReserveTicketsCommand,
};
