use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use effect_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ArtifactEvent, ArtifactId, ContentId, EventId,
    EventType,
};
use fs2::FileExt;
use rusqlite::{params, Connection, TransactionBehavior};
use serde_json::Value;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS governance_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  event_type TEXT NOT NULL CHECK (
    event_type IN (
      'artifact.created',
      'artifact.validated',
      'artifact.approved',
      'artifact.rejected',
      'artifact.executed',
      'artifact.superseded',
      'constraint.evaluated',
      'invariant.checked',
      'execution.logged'
    )
  ),
  artifact_id TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  actor TEXT NOT NULL CHECK (length(trim(actor)) > 0),
  payload_json TEXT NOT NULL DEFAULT '{}',
  content_id TEXT,
  artifact_type TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_governance_events_no_update
BEFORE UPDATE ON governance_events
BEGIN
  SELECT RAISE(FAIL, 'governance_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_governance_events_no_delete
BEFORE DELETE ON governance_events
BEGIN
  SELECT RAISE(FAIL, 'governance_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_governance_events_artifact_seq
  ON governance_events(artifact_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_governance_events_type_seq
  ON governance_events(event_type, event_seq);
";

/// Durable medium behind an [`crate::EventLedger`].
///
/// Several processes may share one medium. A writer takes the medium's
/// exclusive lock with [`LedgerBackend::begin_write`], which also hands back
/// whatever other writers appended since this backend last read or wrote.
pub trait LedgerBackend: Send {
    /// Every stored event in append order.
    fn load(&mut self) -> Result<Vec<ArtifactEvent>>;

    /// Takes the exclusive write lock. Dropping the returned [`LedgerWrite`]
    /// without committing releases the lock and writes nothing.
    fn begin_write(&mut self) -> Result<LedgerWrite<'_>>;

    /// Human-readable location, used in logs.
    fn describe(&self) -> String;

    /// Locks, appends and unlocks in one step, ignoring foreign events.
    fn append_batch(&mut self, events: &[ArtifactEvent]) -> Result<()> {
        self.begin_write()?.commit(events)
    }
}

type CommitFn<'a> = Box<dyn FnOnce(&[ArtifactEvent]) -> Result<()> + 'a>;

/// Exclusive write access to a backend, held until committed or dropped.
pub struct LedgerWrite<'a> {
    tail: Vec<ArtifactEvent>,
    commit: CommitFn<'a>,
}

impl<'a> LedgerWrite<'a> {
    pub fn new(
        tail: Vec<ArtifactEvent>,
        commit: impl FnOnce(&[ArtifactEvent]) -> Result<()> + 'a,
    ) -> Self {
        Self {
            tail,
            commit: Box::new(commit),
        }
    }

    /// Events other writers appended since this backend last read or wrote.
    pub fn take_tail(&mut self) -> Vec<ArtifactEvent> {
        std::mem::take(&mut self.tail)
    }

    /// Appends `events` all-or-nothing and releases the lock.
    pub fn commit(self, events: &[ArtifactEvent]) -> Result<()> {
        (self.commit)(events)
    }
}

pub struct SqliteLedgerBackend {
    conn: Connection,
    location: String,
    last_seq: i64,
}

impl SqliteLedgerBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let backend = Self {
            conn,
            location: format!("sqlite:{}", path.display()),
            last_seq: 0,
        };
        backend.migrate()?;
        Ok(backend)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        let backend = Self {
            conn,
            location: "sqlite::memory:".to_string(),
            last_seq: 0,
        };
        backend.migrate()?;
        Ok(backend)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LedgerBackend for SqliteLedgerBackend {
    fn load(&mut self) -> Result<Vec<ArtifactEvent>> {
        let rows = read_rows_after(&self.conn, 0)?;
        self.last_seq = rows.last().map_or(0, |(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, event)| event).collect())
    }

    fn begin_write(&mut self) -> Result<LedgerWrite<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to take the ledger write lock")?;

        let rows = read_rows_after(&tx, self.last_seq)?;
        if let Some((seq, _)) = rows.last() {
            self.last_seq = *seq;
        }
        let tail = rows.into_iter().map(|(_, event)| event).collect();
        let last_seq = &mut self.last_seq;

        Ok(LedgerWrite::new(tail, move |events| {
            for event in events {
                insert_event(&tx, event)?;
            }
            let seq = tx.last_insert_rowid();
            tx.commit().context("failed to commit event transaction")?;
            if !events.is_empty() {
                *last_seq = seq;
            }
            Ok(())
        }))
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}

fn read_rows_after(conn: &Connection, after_seq: i64) -> Result<Vec<(i64, ArtifactEvent)>> {
    let mut stmt = conn.prepare(
        "SELECT
            event_seq, event_id, event_type, artifact_id, timestamp,
            actor, payload_json, content_id, artifact_type
         FROM governance_events
         WHERE event_seq > ?1
         ORDER BY event_seq ASC",
    )?;
    let rows = stmt.query_map(params![after_seq], |row| {
        Ok((row.get::<_, i64>(0)?, parse_event_row(row)?))
    })?;
    collect_rows(rows)
}

fn insert_event(conn: &Connection, event: &ArtifactEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO governance_events(
            event_id, event_type, artifact_id, timestamp,
            actor, payload_json, content_id, artifact_type
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.event_id.to_string(),
            event.event_type.as_str(),
            event.artifact_id.to_string(),
            format_rfc3339(event.timestamp)?,
            event.actor,
            serde_json::to_string(&event.payload).context("failed to serialize payload")?,
            event.content_id.as_ref().map(ContentId::as_str),
            event.artifact_type,
        ],
    )
    .with_context(|| format!("failed to append event {}", event.event_id))?;
    Ok(())
}

/// One JSON document per line, appended in place.
///
/// Writers serialize on an advisory lock held on a sibling `.lock` file.
pub struct JsonlLedgerBackend {
    path: PathBuf,
    offset: u64,
}

impl JsonlLedgerBackend {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            offset: 0,
        })
    }

    fn lock_file(&self) -> Result<File> {
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("failed to open ledger lock {}", lock_path.display()))
    }

    /// Parses every complete line from `offset` to the end of the file.
    fn read_from(&self, offset: u64) -> Result<(Vec<ArtifactEvent>, u64)> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), offset))
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed to seek {}", self.path.display()))?;
        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let mut events = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: ArtifactEvent = serde_json::from_str(line).with_context(|| {
                if offset == 0 {
                    format!("ledger {} is corrupted at line {}", self.path.display(), index + 1)
                } else {
                    format!(
                        "ledger {} is corrupted at line {} past byte {offset}",
                        self.path.display(),
                        index + 1
                    )
                }
            })?;
            events.push(event);
        }
        Ok((events, offset + raw.len() as u64))
    }
}

impl LedgerBackend for JsonlLedgerBackend {
    fn load(&mut self) -> Result<Vec<ArtifactEvent>> {
        let lock = self.lock_file()?;
        FileExt::lock_shared(&lock)
            .with_context(|| format!("failed to lock {}", self.path.display()))?;
        let (events, end) = self.read_from(0)?;
        self.offset = end;
        Ok(events)
    }

    fn begin_write(&mut self) -> Result<LedgerWrite<'_>> {
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock)
            .with_context(|| format!("failed to lock {}", self.path.display()))?;

        let (tail, end) = self.read_from(self.offset)?;
        self.offset = end;
        let path = &self.path;
        let offset = &mut self.offset;

        Ok(LedgerWrite::new(tail, move |events| {
            let mut buffer = Vec::new();
            for event in events {
                serde_json::to_writer(&mut buffer, event)
                    .with_context(|| format!("failed to encode event {}", event.event_id))?;
                buffer.push(b'\n');
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            file.write_all(&buffer)
                .with_context(|| format!("failed to append to {}", path.display()))?;
            file.sync_data()
                .with_context(|| format!("failed to sync {}", path.display()))?;
            *offset += buffer.len() as u64;
            drop(lock);
            Ok(())
        }))
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

/// Volatile backend; history lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryLedgerBackend {
    events: Vec<ArtifactEvent>,
}

impl MemoryLedgerBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerBackend for MemoryLedgerBackend {
    fn load(&mut self) -> Result<Vec<ArtifactEvent>> {
        Ok(self.events.clone())
    }

    fn begin_write(&mut self) -> Result<LedgerWrite<'_>> {
        let stored = &mut self.events;
        Ok(LedgerWrite::new(Vec::new(), move |events| {
            stored.extend_from_slice(events);
            Ok(())
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactEvent> {
    let event_id_raw: String = row.get(1)?;
    let event_type_raw: String = row.get(2)?;
    let artifact_id_raw: String = row.get(3)?;
    let timestamp_raw: String = row.get(4)?;
    let actor: String = row.get(5)?;
    let payload_raw: String = row.get(6)?;
    let content_id_raw: Option<String> = row.get(7)?;
    let artifact_type: Option<String> = row.get(8)?;

    let event_id = EventId::parse(&event_id_raw).map_err(|err| invalid_text(1, err.to_string()))?;
    let event_type = EventType::parse(&event_type_raw)
        .ok_or_else(|| invalid_text(2, format!("invalid event_type: {event_type_raw}")))?;
    let artifact_id =
        ArtifactId::parse(&artifact_id_raw).map_err(|err| invalid_text(3, err.to_string()))?;
    let timestamp =
        parse_rfc3339_utc(&timestamp_raw).map_err(|err| invalid_text(4, err.to_string()))?;
    let payload: Value = serde_json::from_str(&payload_raw)
        .map_err(|err| invalid_text(6, format!("invalid payload_json: {err}")))?;
    let content_id = content_id_raw
        .as_deref()
        .map(ContentId::parse)
        .transpose()
        .map_err(|err| invalid_text(7, err.to_string()))?;

    Ok(ArtifactEvent {
        event_id,
        event_type,
        artifact_id,
        timestamp,
        actor,
        payload,
        content_id,
        artifact_type,
    })
}

fn invalid_text(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| anyhow!("failed to decode ledger row: {err}"))?);
    }
    Ok(values)
}
