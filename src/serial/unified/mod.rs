pub mod types;
pub mod reader;

pub use reader::{UnifiedSerialBuilder, UnifiedSerialHandle, LineRoute, route_line};
pub use types::{ParsedEvent, CommandSpec, CommandResponse, ResponseMatcher, SerialCommand, MetricsSnapshot};
