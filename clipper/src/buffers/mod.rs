mod media;
mod messages;

pub use media::MediaBuffer;
pub use messages::MessagesBuffer;
