//! Database configuration.

/// Names of the clusters every new database starts with, in id order.
pub const DEFAULT_CLUSTERS: [&str; 6] = ["internal", "index", "default", "users", "roles", "dictionary"];

/// Configuration for creating or opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether reads go through the record cache.
    pub use_cache: bool,

    /// Maximum number of records held by the cache.
    pub cache_capacity: usize,

    /// Clusters created with a new database; ids follow list order.
    pub initial_clusters: Vec<String>,

    /// Cluster used when a logical cluster names no container.
    pub default_cluster: String,

    /// Whether to sync the segment log after every write (safer but slower).
    pub sync_on_write: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache_capacity: 10_000,
            initial_clusters: DEFAULT_CLUSTERS.iter().map(|name| (*name).to_string()).collect(),
            default_cluster: "default".to_string(),
            sync_on_write: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether reads consult the record cache.
    #[must_use]
    pub fn use_cache(mut self, value: bool) -> Self {
        self.use_cache = value;
        self
    }

    /// Sets the cache capacity in records.
    #[must_use]
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Replaces the initial cluster list.
    #[must_use]
    pub fn initial_clusters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_clusters = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the default cluster name.
    #[must_use]
    pub fn default_cluster(mut self, name: impl Into<String>) -> Self {
        self.default_cluster = name.into();
        self
    }

    /// Sets whether to sync the log after every write.
    #[must_use]
    pub fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }
}
