use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Request {
    Run(Job),
    Close,
}

#[derive(Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

impl Location {
    fn open(&self) -> rusqlite::Result<Connection> {
        match self {
            Location::File(path) => Connection::open(path),
            Location::Memory => Connection::open_in_memory(),
        }
    }
}

/// Owns the worker thread. Closing happens when the last `Database` clone
/// goes away.
struct Worker {
    queue: mpsc::Sender<Request>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        // A send failure means the thread already exited.
        let _ = self.queue.send(Request::Close);
        if handle.join().is_err() {
            log_error!("history database worker panicked");
        }
    }
}

/// SQLite connection owned by a dedicated worker thread. Callers queue
/// closures with [`Database::execute`] and await the result.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    location: Arc<Location>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(dir) = db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create history directory {}", dir.display()))?;
        }
        Self::spawn(Location::File(db_path))
    }

    /// Private database that disappears with the last clone.
    pub fn in_memory() -> Result<Self> {
        Self::spawn(Location::Memory)
    }

    fn spawn(location: Location) -> Result<Self> {
        let (queue, requests) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread = thread::Builder::new()
            .name("airwatch-db".into())
            .spawn({
                let location = location.clone();
                move || serve(location, requests, ready_tx)
            })
            .context("cannot start history database worker")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("history database worker exited during startup"))??;

        match &location {
            Location::File(path) => log_info!("history database ready at {}", path.display()),
            Location::Memory => log_info!("in-memory history database ready"),
        }

        Ok(Self {
            worker: Arc::new(Worker {
                queue,
                thread: Mutex::new(Some(thread)),
            }),
            location: Arc::new(location),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        match self.location.as_ref() {
            Location::File(path) => Some(path.as_path()),
            Location::Memory => None,
        }
    }

    /// Runs `task` on the worker thread. Tasks run one at a time in the order
    /// they were queued.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            // The caller may have stopped waiting.
            let _ = reply.send(task(conn));
        });

        self.worker
            .queue
            .send(Request::Run(job))
            .map_err(|_| anyhow!("history database worker is gone"))?;

        response
            .await
            .map_err(|_| anyhow!("history database worker dropped the request"))?
    }
}

fn prepare(location: &Location) -> Result<Connection> {
    let mut conn = location
        .open()
        .context("cannot open history database")?;

    if matches!(location, Location::File(_)) {
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            log_error!("WAL journal unavailable, using default: {err}");
        }
    }
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("cannot enable foreign keys")?;
    run_migrations(&mut conn).context("history schema migration failed")?;
    Ok(conn)
}

fn serve(location: Location, requests: mpsc::Receiver<Request>, ready: mpsc::Sender<Result<()>>) {
    let mut conn = match prepare(&location) {
        Ok(conn) => conn,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    for request in requests {
        match request {
            Request::Run(job) => job(&mut conn),
            Request::Close => break,
        }
    }
    log_info!("history database worker stopped");
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn migrates_a_fresh_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("history.db");
        let db = Database::new(path.clone()).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));

        let version: i32 = db
            .execute(|conn| Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(version, crate::db::migrations::CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn errors_come_back_to_the_caller() {
        let db = Database::in_memory().unwrap();
        let result: Result<()> = db
            .execute(|conn| {
                conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());

        // The worker survives a failed task.
        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
