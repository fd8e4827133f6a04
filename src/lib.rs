// Rust NSQ客户端库核心
// 导出所有公共模块

// 导出模块
pub mod connection;
pub mod error;
pub mod lookup;
pub mod message;
pub mod protocol;
pub mod reader;
pub mod writer;

// 重导出常用类型
pub use connection::{open_connection, Connection, ConnectionOptions, ConnectionStatus};
pub use error::{Error, Result};
pub use message::Message;
pub use protocol::{Command, Frame, FrameDecoder, IdentifyConfig, IdentifyResponse, ProtocolError};
pub use reader::{create_reader, Handler, Reader, ReaderConfig, ReaderStats};
pub use writer::{create_writer, Writer, WriterConfig};
