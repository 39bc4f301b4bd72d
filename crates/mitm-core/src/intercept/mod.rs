//! Packet interception: the wrapper, the handler contract, the ordered
//! registry and the per-packet pipeline that ties them together.

pub mod handler;
pub mod interceptable;
pub mod pipeline;
pub mod registry;

pub use handler::{handler_fn, HandlerContext, HandlerError, PacketHandler, PacketSink, WorkerFuture};
pub use interceptable::{Direction, InterceptablePacket, Verdict};
pub use pipeline::PacketPipeline;
pub use registry::{ChainReport, HandlerRegistry, RegistrationId, RegistrationInfo, RegistryError};
