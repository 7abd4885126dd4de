#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use skylog_core::envelope;
pub use skylog_core::envelope::{
    EnvelopeError, EventEnvelope, EventEnvelopeBatch, JsonMap, NonEmpty,
};

pub mod store {
    pub use skylog_core::store::{
        EventStore, EventStoreError, MAX_EVENT_TYPE_LEN, MAX_STREAM_ID_LEN, MAX_STREAM_TYPE_LEN,
    };

    pub use skylog_core::store::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use skylog_postgres::Store;
    }
}

pub mod index {
    pub use skylog_core::index::{IndexEntry, NaturalKey, StreamIndex, StreamIndexError};

    pub use skylog_core::index::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use skylog_postgres::index::Store;
    }
}
