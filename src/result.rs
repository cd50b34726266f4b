use super::errors::{JobError, PoolError};

pub type JobResult<T> = Result<T, JobError>;

pub type PoolResult<T> = Result<T, PoolError>;
