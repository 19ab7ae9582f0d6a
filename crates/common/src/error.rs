use thiserror::Error;

/// Canonical Rangekeeper error taxonomy used across crates.
///
/// Classification guidance:
/// - availability: the request reached a node that cannot serve it right now
///   ([`RkError::NotStarted`], [`RkError::NotLeader`], [`RkError::StreamClosed`], ...)
/// - correctness: the request itself is invalid against current cluster state
///   ([`RkError::MismatchClusterId`], [`RkError::InvalidKeyRange`], ...)
/// - TSO: timestamp allocation failures ([`RkError::GenerateTimestamp`], ...)
/// - persistence: backend KV failures ([`RkError::TxnInternal`], [`RkError::DataCompacted`], ...)
#[derive(Debug, Error)]
pub enum RkError {
    /// The server has not finished starting or is shutting down.
    #[error("server not started")]
    NotStarted,

    /// A leader-only request reached a non-leader member.
    ///
    /// Callers re-resolve the leader address and retry.
    #[error("not leader: {0}")]
    NotLeader(String),

    /// No leader is currently elected or advertised.
    #[error("leader is nil")]
    LeaderNil,

    /// The endpoint does not permit follower handling for this request.
    #[error("follower handling not allowed: {0}")]
    FollowerNotAllowed(String),

    /// The wrapped stream was already marked closed by a previous error.
    #[error("stream is closed: {0}")]
    StreamClosed(String),

    /// A stream send did not complete within its wall-time deadline.
    #[error("send heartbeat timeout: {0}")]
    SendTimeout(String),

    /// A stream recv did not complete within its wall-time deadline.
    #[error("recv timeout: {0}")]
    RecvTimeout(String),

    /// Too many concurrent TSO proxy streamings on this member.
    #[error("max count of concurrent tso proxy streamings exceeded")]
    MaxConcurrentProxyExceeded,

    /// The per-method rate limit rejected this request.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// The request header carried a cluster id other than ours.
    ///
    /// Fatal for the request; a persisted mismatch is fatal for the server.
    #[error("mismatch cluster id, need {expected} but got {actual}")]
    MismatchClusterId {
        /// Cluster id this member belongs to.
        expected: u64,
        /// Cluster id carried by the request.
        actual: u64,
    },

    /// The cluster has not been bootstrapped yet.
    #[error("cluster is not bootstrapped")]
    NotBootstrapped,

    /// A second bootstrap attempt on an already-bootstrapped cluster.
    #[error("cluster is already bootstrapped")]
    AlreadyBootstrapped,

    /// The reporter speaks a protocol revision this server rejects.
    #[error("incompatible version: {0}")]
    IncompatibleVersion(String),

    /// A request field failed validation.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A scan/batch-scan key range is reversed or overlapped.
    #[error("invalid key range, {0}")]
    InvalidKeyRange(String),

    /// No region was found for the requested key or id.
    #[error("region {0} not found")]
    RegionNotFound(u64),

    /// Batch scan could not cover every requested key range.
    #[error("regions do not contain all key ranges: {0}")]
    RegionsNotContainAllKeyRange(String),

    /// No store record exists for the requested id.
    #[error("store {0} not found")]
    StoreNotFound(u64),

    /// The store is tombstoned and cannot serve or be revived.
    #[error("store {0} has been removed (tombstone)")]
    StoreTombstone(u64),

    /// The bootstrap keyspace is protected from modification.
    #[error("cannot modify protected keyspace")]
    ModifyProtectedKeyspace,

    /// TSO allocation failed.
    ///
    /// Raised when the oracle is uninitialized, the member lost its lease,
    /// the logical counter overflowed past the bounded retries, or the
    /// requested count is not positive.
    #[error("generate timestamp failed: {0}")]
    GenerateTimestamp(String),

    /// A user-driven TSO reset was rejected.
    #[error("reset user timestamp failed: {0}")]
    ResetUserTimestamp(String),

    /// The wall clock moved backwards past the persisted window.
    #[error("incorrect system time")]
    IncorrectSystemTime,

    /// A backend KV transaction failed internally.
    #[error("kv txn internal error: {0}")]
    TxnInternal(String),

    /// A watch resumed from a revision the backend already compacted.
    ///
    /// The watcher re-lists and resumes from the compacted revision.
    #[error("required revision {requested} has been compacted, the compacted revision is {compacted}")]
    DataCompacted {
        /// Revision the watcher asked for.
        requested: u64,
        /// Oldest revision still available.
        compacted: u64,
    },

    /// The backend KV is not reachable or not started.
    #[error("kv backend not started")]
    KvNotStarted,

    /// No scheduler is registered under the given name.
    #[error("scheduler {0} not found")]
    SchedulerNotFound(String),

    /// A scheduler with the given name already exists.
    #[error("scheduler {0} already exists")]
    SchedulerExisted(String),

    /// Catch-all for internal invariant violations.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RkError {
    /// Returns whether a caller should retry after re-resolving the leader
    /// or rebuilding the connection, rather than surfacing the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RkError::NotLeader(_)
                | RkError::LeaderNil
                | RkError::StreamClosed(_)
                | RkError::SendTimeout(_)
                | RkError::RecvTimeout(_)
                | RkError::TxnInternal(_)
        )
    }
}

/// Standard Rangekeeper result alias.
pub type Result<T> = std::result::Result<T, RkError>;
