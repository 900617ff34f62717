pub mod cloud;
pub mod traits;

pub use cloud::CloudChannel;
pub use traits::{ChannelSender, IncomingMessage};
