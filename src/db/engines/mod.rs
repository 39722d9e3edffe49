// Backend Engines
// One DatabaseEngine implementation per database kind, plus shared pool plumbing

pub mod mysql;
pub mod oracle;
pub mod oracle_plan;
pub mod postgres;

pub use mysql::MySqlEngine;
pub use oracle::OracleEngine;
pub use postgres::PostgresEngine;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::db::traits::{CellValue, DatabaseError};

/// Pool sizing shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Connections kept open
    pub pool_size: u32,
    /// Extra connections allowed under load
    pub max_overflow: u32,
    pub checkout_timeout: Duration,
    /// Connections older than this are recycled
    pub max_lifetime: Duration,
}

impl PoolSettings {
    pub fn max_size(&self) -> u32 {
        self.pool_size + self.max_overflow
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            checkout_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

/// A pool created on first use and closed exactly once
pub struct LazyPool<P> {
    pool: Mutex<Option<P>>,
    disposed: AtomicBool,
}

impl<P: Clone> LazyPool<P> {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Return the pool, building it with `init` if this is the first use.
    /// Concurrent first callers wait for a single initialization.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> Result<P, DatabaseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<P, DatabaseError>>,
    {
        if self.is_disposed() {
            return Err(DatabaseError::Disposed);
        }

        let mut guard = self.pool.lock().await;
        if self.is_disposed() {
            return Err(DatabaseError::Disposed);
        }
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        let pool = init().await?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Mark the pool disposed and hand back whatever was built
    pub async fn take(&self) -> Option<P> {
        self.disposed.store(true, Ordering::Release);
        self.pool.lock().await.take()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl<P: Clone> Default for LazyPool<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `fut` under the statement timeout, if one is configured
pub async fn bounded<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, DatabaseError>
where
    F: Future<Output = Result<T, DatabaseError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DatabaseError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Run `fut` under the statement timeout. When the limit is hit, `cancel` runs before the
/// error is returned so the server stops working on the abandoned statement.
pub async fn bounded_or_cancel<T, F, C, CF>(
    timeout: Option<Duration>,
    fut: F,
    cancel: C,
) -> Result<T, DatabaseError>
where
    F: Future<Output = Result<T, DatabaseError>>,
    C: FnOnce() -> CF,
    CF: Future<Output = ()>,
{
    let Some(limit) = timeout else {
        return fut.await;
    };
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            cancel().await;
            Err(DatabaseError::Timeout(limit))
        }
    }
}

/// Decimal text as an integer when it has no fractional part, a float otherwise.
/// NaN and infinities stay text since JSON has no encoding for them.
pub(crate) fn decimal_cell(text: String) -> CellValue {
    if !text.contains('.') {
        if let Ok(v) = text.parse::<i64>() {
            return CellValue::Int(v);
        }
    }
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => CellValue::Float(v),
        _ => CellValue::String(text),
    }
}

/// Replace the encoded password in a connection URI for logging
pub fn redact_password(uri: &str, password: &str) -> String {
    if password.is_empty() {
        return uri.to_string();
    }
    uri.replace(&format!(":{}@", urlencoding::encode(password)), ":***@")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::sync::{mpsc, oneshot, Notify};

    /// Server-side session stand-in: runs one statement at a time until it finishes or is cancelled
    struct FakeSession {
        jobs: mpsc::UnboundedSender<(Duration, oneshot::Sender<()>)>,
        cancel: Arc<Notify>,
    }

    impl FakeSession {
        fn open() -> Self {
            let (jobs, mut queue) = mpsc::unbounded_channel::<(Duration, oneshot::Sender<()>)>();
            let cancel = Arc::new(Notify::new());
            let interrupt = Arc::clone(&cancel);
            tokio::spawn(async move {
                while let Some((work, done)) = queue.recv().await {
                    tokio::select! {
                        _ = tokio::time::sleep(work) => {
                            let _ = done.send(());
                        }
                        _ = interrupt.notified() => {}
                    }
                }
            });
            Self { jobs, cancel }
        }

        async fn run(&self, work: Duration) -> Result<(), DatabaseError> {
            let (done, finished) = oneshot::channel();
            self.jobs
                .send((work, done))
                .map_err(|_| DatabaseError::QueryError("session closed".into()))?;
            finished
                .await
                .map_err(|_| DatabaseError::QueryError("canceling statement".into()))
        }
    }

    struct FakeManager;

    #[async_trait::async_trait]
    impl bb8::ManageConnection for FakeManager {
        type Connection = FakeSession;
        type Error = Infallible;

        async fn connect(&self) -> Result<FakeSession, Infallible> {
            Ok(FakeSession::open())
        }

        async fn is_valid(&self, _: &mut FakeSession) -> Result<(), Infallible> {
            Ok(())
        }

        fn has_broken(&self, _: &mut FakeSession) -> bool {
            false
        }
    }

    async fn single_session_pool(lazy: &LazyPool<bb8::Pool<FakeManager>>) -> bb8::Pool<FakeManager> {
        lazy.get_or_init(|| async {
            Ok(bb8::Pool::builder()
                .max_size(1)
                .connection_timeout(Duration::from_millis(100))
                .build(FakeManager)
                .await
                .unwrap())
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_default_pool_settings() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_size(), 15);
        assert_eq!(settings.checkout_timeout, Duration::from_secs(30));
        assert_eq!(settings.max_lifetime, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_lazy_pool_initializes_once() {
        let pool: Arc<LazyPool<Arc<String>>> = Arc::new(LazyPool::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                pool.get_or_init(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new("pool".to_string()))
                })
                .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lazy_pool_failed_init_can_retry() {
        let pool: LazyPool<u8> = LazyPool::new();
        let first = pool
            .get_or_init(|| async { Err(DatabaseError::ConnectionFailed("down".into())) })
            .await;
        assert!(first.is_err());
        assert_eq!(pool.get_or_init(|| async { Ok(1) }).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disposed_pool_is_not_recreated() {
        let pool: LazyPool<u8> = LazyPool::new();
        pool.get_or_init(|| async { Ok(1) }).await.unwrap();
        assert_eq!(pool.take().await, Some(1));
        assert!(matches!(
            pool.get_or_init(|| async { Ok(2) }).await,
            Err(DatabaseError::Disposed)
        ));
        assert_eq!(pool.take().await, None);
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), _> = bounded(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DatabaseError::Timeout(_))));

        let ok = bounded(None, async { Ok::<_, DatabaseError>(5) }).await.unwrap();
        assert_eq!(ok, 5);
    }

    #[tokio::test]
    async fn test_cancelled_timeout_leaves_connection_usable() {
        let lazy = LazyPool::new();
        let pool = single_session_pool(&lazy).await;

        {
            let conn = pool.get().await.unwrap();
            let cancel = Arc::clone(&conn.cancel);
            let result = bounded_or_cancel(
                Some(Duration::from_millis(50)),
                conn.run(Duration::from_secs(10)),
                || async move { cancel.notify_one() },
            )
            .await;
            assert!(matches!(result, Err(DatabaseError::Timeout(_))));
        }

        let conn = pool.get().await.unwrap();
        let second = bounded_or_cancel(
            Some(Duration::from_secs(2)),
            conn.run(Duration::from_millis(1)),
            || async {},
        )
        .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_statement_blocks_next_caller() {
        let lazy = LazyPool::new();
        let pool = single_session_pool(&lazy).await;

        {
            let conn = pool.get().await.unwrap();
            let first = bounded(Some(Duration::from_millis(50)), conn.run(Duration::from_secs(10))).await;
            assert!(matches!(first, Err(DatabaseError::Timeout(_))));
        }

        let conn = pool.get().await.unwrap();
        let second = bounded(Some(Duration::from_millis(200)), conn.run(Duration::from_millis(1))).await;
        assert!(matches!(second, Err(DatabaseError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_exhausted_pool_reports_pool_error() {
        let lazy = LazyPool::new();
        let pool = single_session_pool(&lazy).await;

        let _held = pool.get().await.unwrap();
        let err = pool
            .get()
            .await
            .map(|_| ())
            .map_err(DatabaseError::from)
            .unwrap_err();
        assert!(matches!(err, DatabaseError::PoolError(_)));
    }

    #[tokio::test]
    async fn test_no_timeout_skips_cancel() {
        let cancelled = AtomicUsize::new(0);
        let counter = &cancelled;
        let value = bounded_or_cancel(None, async { Ok::<_, DatabaseError>(3) }, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decimal_cells() {
        assert_eq!(decimal_cell("42".to_string()), CellValue::Int(42));
        assert_eq!(decimal_cell("12.50".to_string()), CellValue::Float(12.5));
        assert_eq!(
            decimal_cell("99999999999999999999".to_string()),
            CellValue::Float(1e20)
        );
        assert_eq!(decimal_cell("Infinity".to_string()), CellValue::String("Infinity".into()));
        assert_eq!(decimal_cell("-Infinity".to_string()), CellValue::String("-Infinity".into()));
        assert_eq!(decimal_cell("NaN".to_string()), CellValue::String("NaN".into()));
    }

    #[test]
    fn test_redact_password() {
        let uri = "postgresql://reader:p%40ss@db:5432/app";
        assert_eq!(redact_password(uri, "p@ss"), "postgresql://reader:***@db:5432/app");
        assert_eq!(redact_password(uri, ""), uri);
    }
}
