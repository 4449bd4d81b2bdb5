pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod loop_thread;
pub mod poller;
pub mod server;
pub mod socket;
pub mod timing_wheel;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::{Channel, EventSet};
pub use connection::{ConnStatus, Connection, ProtocolCallbacks};
pub use error::{FatalKind, SetupError};
pub use event_loop::EventLoop;
pub use loop_thread::{LoopThread, LoopThreadPool};
pub use poller::Poller;
pub use server::TcpServer;
pub use socket::{IoStatus, Socket};
pub use timing_wheel::{TimingWheel, WHEEL_SLOTS};
