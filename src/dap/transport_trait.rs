use crate::dap::types::Message;
use crate::Result;
use async_trait::async_trait;

/// Read half of a DAP connection. Implementations decode whole frames.
#[async_trait]
pub trait DapReader: Send {
    async fn read_message(&mut self) -> Result<Message>;
}

/// Write half of a DAP connection. One frame per call, single write.
#[async_trait]
pub trait DapWriter: Send {
    async fn write_message(&mut self, msg: &Message) -> Result<()>;
}
