//! Protocol and engine constants shared across modules.
//! Status codes and limits follow NT 2014.002 / NT 2020.001.

/// Distribution status: no further documents available.
pub const CSTAT_NO_DOCUMENTS: u16 = 137;
/// Distribution status: documents present in this batch.
pub const CSTAT_DOCUMENTS_FOUND: u16 = 138;
/// Distribution status: consumption throttled ("uso indevido").
pub const CSTAT_THROTTLED: u16 = 656;
/// Manifestation event accepted and registered.
pub const CSTAT_EVENT_REGISTERED: u16 = 135;

/// Hard ceiling on request/response round trips per sync run.
pub const MAX_SYNC_ITERATIONS: u32 = 200;

/// Minutes a company stays blocked after throttling or full alignment.
pub const BLOCK_MINUTES: i64 = 65;

/// Rolling rate-limit window and per-window call budget (per company, per kind).
pub const RATE_WINDOW_SECS: i64 = 3600;
pub const RATE_MAX_CALLS: u32 = 20;

/// Download lock time-to-live; shorter than the 5-minute sweep cadence
/// so a crashed holder cannot wedge the sweep permanently.
pub const LOCK_TTL_SECS: i64 = 180;

/// Courtesy delay between key lookups within one company's batch.
pub const DOCUMENT_DELAY_MS: u64 = 2000;
/// Delay between distribution round trips within one sync run.
pub const SYNC_ITERATION_DELAY_MS: u64 = 300;

/// Legal deadline for recipient manifestation, days from authorization.
pub const MANIFEST_DEADLINE_DAYS: i64 = 180;

/// Recipient manifestation event types (NT 2020.001).
pub const EVENT_CONFIRMATION: &str = "210200";
pub const EVENT_ACKNOWLEDGMENT: &str = "210210";
pub const EVENT_UNKNOWN_OPERATION: &str = "210220";
pub const EVENT_NOT_PERFORMED: &str = "210240";

pub fn event_description(event_type: &str) -> String {
    match event_type {
        "110110" => "Carta de Correcao".to_string(),
        "110111" => "Cancelamento".to_string(),
        EVENT_CONFIRMATION => "Confirmacao da Operacao".to_string(),
        EVENT_ACKNOWLEDGMENT => "Ciencia da Operacao".to_string(),
        EVENT_UNKNOWN_OPERATION => "Desconhecimento da Operacao".to_string(),
        EVENT_NOT_PERFORMED => "Operacao nao Realizada".to_string(),
        other => format!("Evento {}", other),
    }
}
