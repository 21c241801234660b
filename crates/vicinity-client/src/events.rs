use vicinity_shared::types::{ChatItem, MessageIdentity, NearbyUser, SessionStatus};

/// Events surfaced to the UI layer over the session's event channel.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    StatusChanged(SessionStatus),
    /// A message entered the log, in arrival order.
    MessageAppended(ChatItem),
    /// The nearby-user snapshot was replaced wholesale.
    NearbyUpdated(Vec<NearbyUser>),
    /// A recoverable condition worth showing; the session continues.
    Notice { text: String },
    /// A voice clip played to its natural end.
    PlaybackFinished(MessageIdentity),
}
