use tokio::sync::oneshot;

use crate::Result;
use crate::error::{SnowflakeError, codes, sql_state};

/// A value produced by a background query task, or the value itself once known.
pub(crate) enum Pending<T> {
    Waiting(oneshot::Receiver<std::result::Result<T, SnowflakeError>>),
    Ready(T),
    Failed(SnowflakeError),
}

impl<T> Pending<T> {
    /// Waits for the background task on first use; later calls return the settled outcome.
    pub(crate) async fn resolve(&mut self) -> Result<&mut T> {
        if let Pending::Waiting(rx) = self {
            *self = match rx.await {
                Ok(Ok(value)) => Pending::Ready(value),
                Ok(Err(err)) => Pending::Failed(err),
                Err(_) => Pending::Failed(task_gone()),
            };
        }
        match self {
            Pending::Ready(value) => Ok(value),
            Pending::Failed(err) => Err(err.clone().into()),
            Pending::Waiting(_) => Err(task_gone().into()),
        }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        matches!(self, Pending::Waiting(_))
    }
}

fn task_gone() -> SnowflakeError {
    SnowflakeError::new(
        codes::ASYNC,
        sql_state::GENERAL_ERROR,
        "async query task ended without a result",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn resolves_once_and_keeps_the_value() {
        let (tx, rx) = oneshot::channel();
        let mut pending: Pending<i64> = Pending::Waiting(rx);
        assert!(pending.is_waiting());
        tx.send(Ok(3)).unwrap();

        assert_eq!(*pending.resolve().await.unwrap(), 3);
        *pending.resolve().await.unwrap() += 1;
        assert_eq!(*pending.resolve().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn failure_is_repeated() {
        let (tx, rx) = oneshot::channel::<std::result::Result<i64, SnowflakeError>>();
        let mut pending = Pending::Waiting(rx);
        tx.send(Err(SnowflakeError::new(2003, "02000", "missing"))).unwrap();

        for _ in 0..2 {
            let Err(Error::Snowflake(err)) = pending.resolve().await else {
                panic!("expected the server error");
            };
            assert_eq!(err.number, 2003);
        }
    }

    #[tokio::test]
    async fn dropped_task_is_an_async_error() {
        let (tx, rx) = oneshot::channel::<std::result::Result<i64, SnowflakeError>>();
        drop(tx);
        let mut pending = Pending::Waiting(rx);
        let Err(Error::Snowflake(err)) = pending.resolve().await else {
            panic!("expected an async error");
        };
        assert_eq!(err.number, codes::ASYNC);
    }
}
