//! Durable session store
//!
//! One SQLite connection behind a mutex; every mutation runs in its own
//! transaction so a crash between checkpoints never leaves partial state.
//! The executor owns batching (at most one checkpoint per 250 ms or 50
//! recipients); the store just makes each write atomic.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::warn;

use bulksms_core::compliance::{OptOutRecord, OptOutView};
use bulksms_core::errors::StorageError;
use bulksms_core::message::{MessageStatus, OutboundMessage};
use bulksms_core::session::{CampaignSession, CampaignType, CheckpointPatch, ProcessingStatus};
use bulksms_core::types::{MessageId, PhoneNumber, SessionId, Timestamp};

use crate::schema;

// ----------------------------------------------------------------------------
// Error Mapping
// ----------------------------------------------------------------------------

fn write_err(err: rusqlite::Error) -> StorageError {
    StorageError::Write {
        reason: err.to_string(),
    }
}

fn read_err(err: rusqlite::Error) -> StorageError {
    StorageError::Read {
        reason: err.to_string(),
    }
}

fn corrupt(reason: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        reason: reason.into(),
    }
}

// ----------------------------------------------------------------------------
// Session Store
// ----------------------------------------------------------------------------

/// A pending scheduled fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub session_id: SessionId,
    pub fire_at: Timestamp,
    pub timezone: Option<String>,
}

/// Transactional local store backing sessions, messages, opt-outs, schedules
/// and executor leases
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (creating if needed) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(write_err)?;
        schema::init(&conn).map_err(write_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Ephemeral store for tests
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(write_err)?;
        schema::init(&conn).map_err(write_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self.conn.lock().expect("store lock");
        let tx = conn.transaction().map_err(write_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(write_err)?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Upsert a full session document
    pub fn save(&self, session: &CampaignSession) -> Result<(), StorageError> {
        let recipients = serde_json::to_string(&session.recipients)
            .map_err(|e| corrupt(format!("recipients encode: {e}")))?;
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO sessions (
                    session_id, file_name, campaign_name, campaign_type, recipients,
                    template, send_speed, sim_slot, last_processed_index, sent_count,
                    failed_count, skipped_count, processing_status, scheduled_at,
                    scheduled_tz, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(session_id) DO UPDATE SET
                    file_name = excluded.file_name,
                    campaign_name = excluded.campaign_name,
                    campaign_type = excluded.campaign_type,
                    recipients = excluded.recipients,
                    template = excluded.template,
                    send_speed = excluded.send_speed,
                    sim_slot = excluded.sim_slot,
                    last_processed_index = excluded.last_processed_index,
                    sent_count = excluded.sent_count,
                    failed_count = excluded.failed_count,
                    skipped_count = excluded.skipped_count,
                    processing_status = excluded.processing_status,
                    scheduled_at = excluded.scheduled_at,
                    scheduled_tz = excluded.scheduled_tz,
                    updated_at = excluded.updated_at",
                params![
                    session.session_id.to_string(),
                    session.file_name,
                    session.campaign_name,
                    session.campaign_type.as_str(),
                    recipients,
                    session.template,
                    session.send_speed,
                    session.sim_slot,
                    session.last_processed_index,
                    session.sent_count,
                    session.failed_count,
                    session.skipped_count,
                    session.processing_status.as_str(),
                    session.scheduled_at.map(|t| t.as_millis()),
                    session.scheduled_tz,
                    session.created_at.as_millis(),
                    session.updated_at.as_millis(),
                ],
            )
            .map_err(write_err)?;
            Ok(())
        })
    }

    /// Load one session by id
    pub fn load(&self, session_id: SessionId) -> Result<CampaignSession, StorageError> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT session_id, file_name, campaign_name, campaign_type, recipients,
                    template, send_speed, sim_slot, last_processed_index, sent_count,
                    failed_count, skipped_count, processing_status, scheduled_at,
                    scheduled_tz, created_at, updated_at
             FROM sessions WHERE session_id = ?1",
            params![session_id.to_string()],
            session_from_row,
        )
        .optional()
        .map_err(read_err)?
        .ok_or(StorageError::SessionNotFound(session_id))?
    }

    /// The most recently touched session still sending or paused, if any
    pub fn load_active(&self) -> Result<Option<CampaignSession>, StorageError> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT session_id, file_name, campaign_name, campaign_type, recipients,
                    template, send_speed, sim_slot, last_processed_index, sent_count,
                    failed_count, skipped_count, processing_status, scheduled_at,
                    scheduled_tz, created_at, updated_at
             FROM sessions
             WHERE processing_status IN ('sending', 'paused')
             ORDER BY updated_at DESC LIMIT 1",
            [],
            session_from_row,
        )
        .optional()
        .map_err(read_err)?
        .transpose()
    }

    /// Partial progress update; the durable half of an executor checkpoint
    pub fn checkpoint(
        &self,
        session_id: SessionId,
        patch: &CheckpointPatch,
        now: Timestamp,
    ) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE sessions SET
                        last_processed_index = ?2,
                        sent_count = ?3,
                        failed_count = ?4,
                        skipped_count = ?5,
                        processing_status = ?6,
                        updated_at = ?7
                     WHERE session_id = ?1",
                    params![
                        session_id.to_string(),
                        patch.last_processed_index,
                        patch.sent_count,
                        patch.failed_count,
                        patch.skipped_count,
                        patch.processing_status.as_str(),
                        now.as_millis(),
                    ],
                )
                .map_err(write_err)?;
            if changed == 0 {
                return Err(StorageError::SessionNotFound(session_id));
            }
            Ok(())
        })
    }

    /// Remove a session with its messages, schedule and lease
    pub fn clear(&self, session_id: SessionId) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            let id = session_id.to_string();
            tx.execute("DELETE FROM outbound_messages WHERE session_id = ?1", [&id])
                .map_err(write_err)?;
            tx.execute("DELETE FROM schedules WHERE session_id = ?1", [&id])
                .map_err(write_err)?;
            tx.execute("DELETE FROM leases WHERE session_id = ?1", [&id])
                .map_err(write_err)?;
            tx.execute("DELETE FROM sessions WHERE session_id = ?1", [&id])
                .map_err(write_err)?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------

    /// Take (or renew) exclusive ownership of a session.
    ///
    /// Succeeds iff there is no unexpired lease held by a different owner;
    /// re-acquiring one's own lease extends it.
    pub fn acquire_lease(
        &self,
        session_id: SessionId,
        owner_id: &str,
        ttl_ms: u64,
        now: Timestamp,
    ) -> Result<bool, StorageError> {
        self.with_tx(|tx| {
            let existing: Option<(String, u64)> = tx
                .query_row(
                    "SELECT owner_id, expires_at FROM leases WHERE session_id = ?1",
                    params![session_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(read_err)?;

            if let Some((holder, expires_at)) = existing {
                if holder != owner_id && expires_at > now.as_millis() {
                    return Ok(false);
                }
            }

            tx.execute(
                "INSERT INTO leases (session_id, owner_id, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                    owner_id = excluded.owner_id,
                    expires_at = excluded.expires_at",
                params![
                    session_id.to_string(),
                    owner_id,
                    now.as_millis() + ttl_ms
                ],
            )
            .map_err(write_err)?;
            Ok(true)
        })
    }

    /// Drop a lease if still held by `owner_id`
    pub fn release_lease(&self, session_id: SessionId, owner_id: &str) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM leases WHERE session_id = ?1 AND owner_id = ?2",
                params![session_id.to_string(), owner_id],
            )
            .map_err(write_err)?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Outbound Messages / Retry Queue
    // ------------------------------------------------------------------

    /// Persist a new message row (status `PENDING`)
    pub fn insert_message(&self, msg: &OutboundMessage) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO outbound_messages (
                    msg_id, session_id, recipient_index, phone, body, sim_slot,
                    status, retry_count, next_retry_at, error_code, error_message,
                    created_at, sent_at, delivered_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    msg.msg_id.to_string(),
                    msg.session_id.to_string(),
                    msg.recipient_index,
                    msg.phone.as_str(),
                    msg.body,
                    msg.sim_slot,
                    msg.status.as_str(),
                    msg.retry_count,
                    msg.next_retry_at.map(|t| t.as_millis()),
                    msg.error_code,
                    msg.error_message,
                    msg.created_at.as_millis(),
                    msg.sent_at.map(|t| t.as_millis()),
                    msg.delivered_at.map(|t| t.as_millis()),
                ],
            )
            .map_err(write_err)?;
            Ok(())
        })
    }

    /// Persist the full current state of a message row
    pub fn update_message(&self, msg: &OutboundMessage) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE outbound_messages SET
                        session_id = ?2, recipient_index = ?3, phone = ?4, body = ?5,
                        sim_slot = ?6, status = ?7, retry_count = ?8, next_retry_at = ?9,
                        claimed_until = NULL,
                        error_code = ?10, error_message = ?11, created_at = ?12,
                        sent_at = ?13, delivered_at = ?14
                     WHERE msg_id = ?1",
                    params![
                        msg.msg_id.to_string(),
                        msg.session_id.to_string(),
                        msg.recipient_index,
                        msg.phone.as_str(),
                        msg.body,
                        msg.sim_slot,
                        msg.status.as_str(),
                        msg.retry_count,
                        msg.next_retry_at.map(|t| t.as_millis()),
                        msg.error_code,
                        msg.error_message,
                        msg.created_at.as_millis(),
                        msg.sent_at.map(|t| t.as_millis()),
                        msg.delivered_at.map(|t| t.as_millis()),
                    ],
                )
                .map_err(write_err)?;
            if changed == 0 {
                return Err(StorageError::MessageNotFound(msg.msg_id));
            }
            Ok(())
        })
    }

    /// Update only status-related columns of a message
    pub fn update_message_status(
        &self,
        msg_id: MessageId,
        status: MessageStatus,
        sent_at: Option<Timestamp>,
        delivered_at: Option<Timestamp>,
    ) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE outbound_messages SET
                        status = ?2,
                        claimed_until = NULL,
                        sent_at = COALESCE(?3, sent_at),
                        delivered_at = COALESCE(?4, delivered_at)
                     WHERE msg_id = ?1",
                    params![
                        msg_id.to_string(),
                        status.as_str(),
                        sent_at.map(|t| t.as_millis()),
                        delivered_at.map(|t| t.as_millis()),
                    ],
                )
                .map_err(write_err)?;
            if changed == 0 {
                return Err(StorageError::MessageNotFound(msg_id));
            }
            Ok(())
        })
    }

    /// Load one message
    pub fn message(&self, msg_id: MessageId) -> Result<OutboundMessage, StorageError> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT msg_id, session_id, recipient_index, phone, body, sim_slot,
                    status, retry_count, next_retry_at, error_code, error_message,
                    created_at, sent_at, delivered_at
             FROM outbound_messages WHERE msg_id = ?1",
            params![msg_id.to_string()],
            message_from_row,
        )
        .optional()
        .map_err(read_err)?
        .ok_or(StorageError::MessageNotFound(msg_id))?
    }

    /// All messages of one session, oldest first
    pub fn session_messages(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<OutboundMessage>, StorageError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare(
                "SELECT msg_id, session_id, recipient_index, phone, body, sim_slot,
                        status, retry_count, next_retry_at, error_code, error_message,
                        created_at, sent_at, delivered_at
                 FROM outbound_messages WHERE session_id = ?1
                 ORDER BY created_at, msg_id",
            )
            .map_err(read_err)?;
        let rows = stmt
            .query_map(params![session_id.to_string()], message_from_row)
            .map_err(read_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(read_err)??);
        }
        Ok(out)
    }

    /// Claim all due retries for a session, ordered by wake-up time.
    ///
    /// Claimed rows keep status `PENDING_RETRY` but carry a claim lease
    /// (`claimed_until = now + claim_ttl_ms`) and are skipped by further
    /// drains until the lease expires. Resolving the attempt (any
    /// [`Self::update_message`] / [`Self::update_message_status`] write)
    /// clears the claim; a crash before resolution leaves the row drainable
    /// again once the lease runs out, so the queue stays at-least-once.
    pub fn drain_due(
        &self,
        session_id: SessionId,
        now: Timestamp,
        claim_ttl_ms: u64,
    ) -> Result<Vec<OutboundMessage>, StorageError> {
        self.with_tx(|tx| {
            let mut stmt = tx
                .prepare(
                    "SELECT msg_id, session_id, recipient_index, phone, body, sim_slot,
                            status, retry_count, next_retry_at, error_code, error_message,
                            created_at, sent_at, delivered_at
                     FROM outbound_messages
                     WHERE session_id = ?1 AND status = 'PENDING_RETRY'
                       AND next_retry_at <= ?2
                       AND (claimed_until IS NULL OR claimed_until <= ?2)
                     ORDER BY next_retry_at",
                )
                .map_err(read_err)?;
            let rows = stmt
                .query_map(
                    params![session_id.to_string(), now.as_millis()],
                    message_from_row,
                )
                .map_err(read_err)?;
            let mut due = Vec::new();
            for row in rows {
                due.push(row.map_err(read_err)??);
            }
            drop(stmt);

            let claimed_until = now.add_millis(claim_ttl_ms);
            for msg in &due {
                tx.execute(
                    "UPDATE outbound_messages SET claimed_until = ?2 WHERE msg_id = ?1",
                    params![msg.msg_id.to_string(), claimed_until.as_millis()],
                )
                .map_err(write_err)?;
            }
            Ok(due)
        })
    }

    /// Earliest effective retry wake-up for a session, if any.
    ///
    /// A claimed row's wake-up is its claim expiry, so a resumed executor
    /// sleeps until an orphaned claim becomes reclaimable instead of polling.
    pub fn next_retry_at(&self, session_id: SessionId) -> Result<Option<Timestamp>, StorageError> {
        let conn = self.conn.lock().expect("store lock");
        let at: Option<u64> = conn
            .query_row(
                "SELECT MIN(MAX(next_retry_at, COALESCE(claimed_until, 0)))
                 FROM outbound_messages
                 WHERE session_id = ?1 AND status = 'PENDING_RETRY'",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .map_err(read_err)?;
        Ok(at.map(Timestamp::new))
    }

    /// Count of messages still waiting in the retry queue for a session
    pub fn pending_retry_count(&self, session_id: SessionId) -> Result<u64, StorageError> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT COUNT(*) FROM outbound_messages
             WHERE session_id = ?1 AND status = 'PENDING_RETRY'",
            params![session_id.to_string()],
            |row| row.get(0),
        )
        .map_err(read_err)
    }

    /// Drop a session's queued retries (stop semantics); returns how many
    pub fn purge_pending_retries(&self, session_id: SessionId) -> Result<u64, StorageError> {
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE outbound_messages
                     SET status = 'FAILED', error_code = 'E_CANCELLED',
                         error_message = 'campaign stopped', next_retry_at = NULL,
                         claimed_until = NULL
                     WHERE session_id = ?1 AND status = 'PENDING_RETRY'",
                    params![session_id.to_string()],
                )
                .map_err(write_err)?;
            Ok(changed as u64)
        })
    }

    /// Delete exhausted rows everywhere; control-surface maintenance
    pub fn clear_exhausted(&self) -> Result<u64, StorageError> {
        self.with_tx(|tx| {
            let changed = tx
                .execute(
                    "DELETE FROM outbound_messages WHERE status = 'EXHAUSTED'",
                    [],
                )
                .map_err(write_err)?;
            Ok(changed as u64)
        })
    }

    // ------------------------------------------------------------------
    // Opt-Outs
    // ------------------------------------------------------------------

    /// Record an opt-out; idempotent per phone
    pub fn add_opt_out(&self, record: &OptOutRecord) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO optouts (phone, reason, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(phone) DO NOTHING",
                params![
                    record.phone.as_str(),
                    record.reason,
                    record.created_at.as_millis()
                ],
            )
            .map_err(write_err)?;
            Ok(())
        })
    }

    pub fn remove_opt_out(&self, phone: &PhoneNumber) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM optouts WHERE phone = ?1",
                params![phone.as_str()],
            )
            .map_err(write_err)?;
            Ok(())
        })
    }

    pub fn opt_outs(&self) -> Result<Vec<OptOutRecord>, StorageError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare("SELECT phone, reason, created_at FROM optouts ORDER BY created_at")
            .map_err(read_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                ))
            })
            .map_err(read_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (phone, reason, created_at) = row.map_err(read_err)?;
            let phone = PhoneNumber::parse(&phone)
                .map_err(|e| corrupt(format!("opt-out phone {phone:?}: {e}")))?;
            out.push(OptOutRecord {
                phone,
                reason,
                created_at: Timestamp::new(created_at),
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    /// Persist (or move) a scheduled fire time for a session
    pub fn put_schedule(
        &self,
        session_id: SessionId,
        fire_at: Timestamp,
        timezone: Option<&str>,
        now: Timestamp,
    ) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO schedules (session_id, fire_at_ms, timezone, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                    fire_at_ms = excluded.fire_at_ms,
                    timezone = excluded.timezone",
                params![
                    session_id.to_string(),
                    fire_at.as_millis(),
                    timezone,
                    now.as_millis()
                ],
            )
            .map_err(write_err)?;
            Ok(())
        })
    }

    pub fn remove_schedule(&self, session_id: SessionId) -> Result<(), StorageError> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM schedules WHERE session_id = ?1",
                params![session_id.to_string()],
            )
            .map_err(write_err)?;
            Ok(())
        })
    }

    /// Every persisted schedule, earliest first; startup recovery reads this
    pub fn all_schedules(&self) -> Result<Vec<ScheduleEntry>, StorageError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare(
                "SELECT session_id, fire_at_ms, timezone FROM schedules ORDER BY fire_at_ms",
            )
            .map_err(read_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(read_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (id, fire_at, timezone) = row.map_err(read_err)?;
            let session_id = SessionId::from_str(&id)
                .map_err(|e| corrupt(format!("schedule session id {id:?}: {e}")))?;
            out.push(ScheduleEntry {
                session_id,
                fire_at: Timestamp::new(fire_at),
                timezone,
            });
        }
        Ok(out)
    }
}

/// The durable opt-out set doubles as the compliance gate's view.
///
/// A read failure is logged and treated as "not opted out"; the send is
/// still subject to every other gate layer.
impl OptOutView for SessionStore {
    fn is_opted_out(&self, phone: &PhoneNumber) -> bool {
        let conn = self.conn.lock().expect("store lock");
        let found: Result<Option<u32>, _> = conn
            .query_row(
                "SELECT 1 FROM optouts WHERE phone = ?1",
                params![phone.as_str()],
                |row| row.get(0),
            )
            .optional();
        match found {
            Ok(row) => row.is_some(),
            Err(err) => {
                warn!(error = %err, phone = %phone, "opt-out lookup failed");
                false
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Row Mapping
// ----------------------------------------------------------------------------

type RowResult<T> = rusqlite::Result<Result<T, StorageError>>;

fn session_from_row(row: &Row<'_>) -> RowResult<CampaignSession> {
    let session_id: String = row.get(0)?;
    let campaign_type: String = row.get(3)?;
    let recipients_json: String = row.get(4)?;
    let processing_status: String = row.get(12)?;

    Ok((|| {
        Ok(CampaignSession {
            session_id: SessionId::from_str(&session_id)
                .map_err(|e| corrupt(format!("session id {session_id:?}: {e}")))?,
            file_name: row_get(row, 1)?,
            campaign_name: row_get(row, 2)?,
            campaign_type: CampaignType::from_str(&campaign_type).map_err(corrupt)?,
            recipients: serde_json::from_str(&recipients_json)
                .map_err(|e| corrupt(format!("recipients decode: {e}")))?,
            template: row_get(row, 5)?,
            send_speed: row_get(row, 6)?,
            sim_slot: row_get(row, 7)?,
            last_processed_index: row_get(row, 8)?,
            sent_count: row_get(row, 9)?,
            failed_count: row_get(row, 10)?,
            skipped_count: row_get(row, 11)?,
            processing_status: ProcessingStatus::from_str(&processing_status).map_err(corrupt)?,
            scheduled_at: row_get::<Option<u64>>(row, 13)?.map(Timestamp::new),
            scheduled_tz: row_get(row, 14)?,
            created_at: Timestamp::new(row_get(row, 15)?),
            updated_at: Timestamp::new(row_get(row, 16)?),
        })
    })())
}

fn message_from_row(row: &Row<'_>) -> RowResult<OutboundMessage> {
    let msg_id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let phone: String = row.get(3)?;
    let status: String = row.get(6)?;

    Ok((|| {
        Ok(OutboundMessage {
            msg_id: MessageId::from_str(&msg_id)
                .map_err(|e| corrupt(format!("msg id {msg_id:?}: {e}")))?,
            session_id: SessionId::from_str(&session_id)
                .map_err(|e| corrupt(format!("session id {session_id:?}: {e}")))?,
            recipient_index: row_get(row, 2)?,
            phone: PhoneNumber::parse(&phone)
                .map_err(|e| corrupt(format!("phone {phone:?}: {e}")))?,
            body: row_get(row, 4)?,
            sim_slot: row_get(row, 5)?,
            status: MessageStatus::from_str(&status).map_err(corrupt)?,
            retry_count: row_get(row, 7)?,
            next_retry_at: row_get::<Option<u64>>(row, 8)?.map(Timestamp::new),
            error_code: row_get(row, 9)?,
            error_message: row_get(row, 10)?,
            created_at: Timestamp::new(row_get(row, 11)?),
            sent_at: row_get::<Option<u64>>(row, 12)?.map(Timestamp::new),
            delivered_at: row_get::<Option<u64>>(row, 13)?.map(Timestamp::new),
        })
    })())
}

fn row_get<T: rusqlite::types::FromSql>(row: &Row<'_>, idx: usize) -> Result<T, StorageError> {
    row.get(idx).map_err(read_err)
}
