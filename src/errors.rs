use std::time::Duration;

/// The error kinds surfaced by the core. These map directly onto the HTTP status
/// codes used by the (external) controller layer: InputInvalid->400, NotFound->404,
/// Conflict->409, Cancelled->499, everything else->500.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cancelled")]
    Cancelled,

    /// Unrecoverable failure: decryption failure, malformed CSV header, schema
    /// mismatch. Logged, recorded on the file/phase/operation as Failed, never
    /// retried.
    #[error("permanent failure: {0}")]
    PermanentIo(String),

    /// Recoverable failure: network blip, throttling, 5xx. Retried with bounded
    /// exponential backoff inside the object/document store adapters; becomes
    /// `PermanentIo` once the retry budget is exhausted.
    #[error("transient failure after {attempts} attempt(s): {message}")]
    TransientIo { message: String, attempts: u32 },

    /// Empty composite key part, duplicate lineage event with conflicting values.
    /// Hard-fails the file/operation that raised it.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    #[error(transparent)]
    Bson(#[from] bson::ser::Error),

    #[error(transparent)]
    BsonDe(#[from] bson::de::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo { .. })
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Error::InputInvalid(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Cancelled => 499,
            _ => 500,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Retries `f` up to `config.max_attempts` times, sleeping with jittered
/// exponential backoff between attempts whenever the error is transient.
/// Mirrors the retry contract described for `ObjectStore`/`DocumentStore`
/// adapters: transient errors are retried in place, permanent errors abort
/// immediately, and exhausting the attempt budget surfaces a `PermanentIo`.
pub async fn retry_transient<F, Fut, T>(op_name: &str, config: &crate::backoff::BackoffConfig, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut backoff = crate::backoff::Backoff::new(config);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < config.max_attempts => {
                let wait: Duration = backoff.next();
                tracing::warn!(op = op_name, attempt, wait_ms = wait.as_millis() as u64, error = %err, "transient failure, retrying");
                tokio::time::sleep(wait).await;
            }
            Err(Error::TransientIo { message, attempts }) => {
                return Err(Error::PermanentIo(format!("{op_name} exhausted retries after {attempts} attempt(s): {message}")));
            }
            Err(err) => return Err(err),
        }
    }
}
