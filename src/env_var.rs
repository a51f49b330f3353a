use std::sync::OnceLock;

use serde::Deserialize;

fn default_bulk_min_size_bytes() -> usize {
    4096
}

fn default_threads() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.into(),
        Err(_) => 4,
    }
}

fn default_true() -> bool {
    true
}

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_amq_msg_size() -> usize {
    256
}

fn default_amq_msg_count() -> usize {
    1024
}

fn default_local_heap_size() -> usize {
    16 * 1024 * 1024
}

fn default_num_units() -> usize {
    1
}

fn default_shmem_heap_size() -> usize {
    128 * 1024 * 1024
}

/// Active-message queue implementation selected by `DART_AMQ_IMPL`.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AmqImpl {
    /// Double-buffered queues with cancellable writers.
    NoLock,
    /// A single queue with an atomic reservation cursor and a ready mark.
    Atomic,
}

fn default_amq_impl() -> AmqImpl {
    AmqImpl::NoLock
}

/// Runtime configuration, read once from `DART_*` environment variables.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Advisory minimum transfer size for bulk operations, default: 4096
    #[serde(default = "default_bulk_min_size_bytes")]
    pub bulk_min_size_bytes: usize,

    /// Number of task threads including the master thread, default: available parallelism
    #[serde(default = "default_threads")]
    pub task_num_threads: usize,

    /// `nolock` or `atomic`, default: nolock
    #[serde(default = "default_amq_impl")]
    pub amq_impl: AmqImpl,

    /// Blocking put/get copy directly through the shared mapping, default: true
    #[serde(default = "default_true")]
    pub sharedmem_enable: bool,

    /// Install a trace level stderr subscriber when a world is built, default: false
    #[serde(default)]
    pub enable_logging: bool,

    /// Seconds after which a waiting collective reports a potential deadlock, default: 600.0
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    #[serde(default = "default_amq_msg_size")]
    pub amq_msg_size: usize,
    #[serde(default = "default_amq_msg_count")]
    pub amq_msg_count: usize,

    /// Bytes reserved per unit for `segment_alloc_local`, default: 16 MiB
    #[serde(default = "default_local_heap_size")]
    pub local_heap_size: usize,

    /// Units of a shared-memory job started as separate processes, default: 1
    #[serde(default = "default_num_units")]
    pub num_units: usize,

    /// This process's unit within its job, default: 0
    #[serde(default)]
    pub unit_id: usize,

    /// Identifies the shared-memory objects of one job; required when `num_units > 1`
    pub job_id: Option<usize>,

    /// Bytes of shared memory per unit holding all of its registered memory, default: 128 MiB
    #[serde(default = "default_shmem_heap_size")]
    pub shmem_heap_size: usize,

    /// Pin worker threads to cores, default: false
    #[serde(default)]
    pub bind_threads: bool,

    /// flag used to print warnings when handles are dropped without being waited on. Default: true
    pub dropped_handle_warning: Option<bool>,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("DART_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_environment() {
        let config: Config = envy::prefixed("DART_TEST_UNSET_")
            .from_iter(std::iter::empty::<(String, String)>())
            .unwrap();
        assert_eq!(config.bulk_min_size_bytes, 4096);
        assert_eq!(config.amq_impl, AmqImpl::NoLock);
        assert!(config.sharedmem_enable);
        assert!(!config.enable_logging);
        assert!(config.task_num_threads >= 1);
        assert_eq!(config.num_units, 1);
        assert_eq!(config.unit_id, 0);
        assert_eq!(config.job_id, None);
    }

    #[test]
    fn parses_prefixed_variables() {
        let vars = vec![
            ("DART_AMQ_IMPL".to_string(), "atomic".to_string()),
            ("DART_TASK_NUM_THREADS".to_string(), "3".to_string()),
            ("DART_SHAREDMEM_ENABLE".to_string(), "false".to_string()),
            ("DART_BULK_MIN_SIZE_BYTES".to_string(), "65536".to_string()),
            ("DART_NUM_UNITS".to_string(), "4".to_string()),
            ("DART_UNIT_ID".to_string(), "2".to_string()),
            ("DART_JOB_ID".to_string(), "77".to_string()),
        ];
        let config: Config = envy::prefixed("DART_").from_iter(vars).unwrap();
        assert_eq!(config.amq_impl, AmqImpl::Atomic);
        assert_eq!(config.task_num_threads, 3);
        assert!(!config.sharedmem_enable);
        assert_eq!(config.bulk_min_size_bytes, 65536);
        assert_eq!((config.num_units, config.unit_id, config.job_id), (4, 2, Some(77)));
    }
}
