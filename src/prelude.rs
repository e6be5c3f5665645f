pub use std::sync::Arc;
pub use std::time::Duration;

pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use tokio::sync::broadcast;

pub use crate::channels::Channels;
pub use crate::config::{Config, ConfigWrapper};
pub use crate::items::{EntityType, Item, ItemCommon, ItemRead, Value};
pub use crate::options::Options;
pub use crate::snapshot::{Snapshot, SnapshotStore};
pub use crate::{file_error, file_error_with_source};
