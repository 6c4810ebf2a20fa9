//! Annex domain model: the content-key grammar, the object-store path
//! classifier, and the query interface to the tracking layer.

pub mod key;
pub mod layout;
pub mod store;

pub use key::{AnnexKey, KeyError};
pub use layout::{classify, PathState};
pub use store::{
    GitAnnexStore, RemoteEntry, RemoteLocation, StaticTrackingStore, TrackingStore,
};
