//! Metrics definitions for the statistics server.

use shared::metrics_defs::{MetricDef, MetricType};

pub const DATAGRAMS_RECEIVED: MetricDef = MetricDef {
    name: "datagrams.received",
    metric_type: MetricType::Counter,
    description: "Number of datagrams read from the socket",
};

pub const DATAGRAMS_MALFORMED: MetricDef = MetricDef {
    name: "datagrams.malformed",
    metric_type: MetricType::Counter,
    description: "Datagrams dropped for a wrong size, a bad checksum or undecodable fields",
};

pub const DATAGRAMS_UNAUTHORIZED: MetricDef = MetricDef {
    name: "datagrams.unauthorized",
    metric_type: MetricType::Counter,
    description: "Datagrams dropped because the sender is not an authorized host",
};

pub const DATAGRAMS_FAILED: MetricDef = MetricDef {
    name: "datagrams.failed",
    metric_type: MetricType::Counter,
    description: "Datagrams dropped because the usage record could not be stored",
};

pub const DATAGRAMS_STORED: MetricDef = MetricDef {
    name: "datagrams.stored",
    metric_type: MetricType::Counter,
    description: "Datagrams committed to the statistics database",
};

pub const KEYS_CREATED: MetricDef = MetricDef {
    name: "keys.created",
    metric_type: MetricType::Counter,
    description: "Surrogate keys inserted for previously unseen values",
};

pub const KEY_CACHE_HIT: MetricDef = MetricDef {
    name: "keys.cache.hit",
    metric_type: MetricType::Counter,
    description: "Key resolutions answered from the in-memory cache",
};

pub const KEY_CACHE_MISS: MetricDef = MetricDef {
    name: "keys.cache.miss",
    metric_type: MetricType::Counter,
    description: "Key resolutions that had to query the database",
};

pub const PERSIST_DURATION: MetricDef = MetricDef {
    name: "persist.duration",
    metric_type: MetricType::Histogram,
    description: "Time to resolve keys and commit one usage record, in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    DATAGRAMS_RECEIVED,
    DATAGRAMS_MALFORMED,
    DATAGRAMS_UNAUTHORIZED,
    DATAGRAMS_FAILED,
    DATAGRAMS_STORED,
    KEYS_CREATED,
    KEY_CACHE_HIT,
    KEY_CACHE_MISS,
    PERSIST_DURATION,
];
