use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub from_coordinator: broadcast::Sender<crate::coordinator::ChannelData>,
    pub to_coordinator: broadcast::Sender<crate::coordinator::ChannelData>,
    pub to_pilot: broadcast::Sender<crate::pilot::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            from_coordinator: Self::channel(),
            to_coordinator: Self::channel(),
            to_pilot: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
