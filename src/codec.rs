//! Pure wire-protocol translation for the SEFAZ distribution service.
//! Builds outbound SOAP envelopes and parses/decompresses inbound
//! responses. No I/O happens here.

use crate::domain::{Environment, NfeStatus};
use crate::error::{EngineError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, Utc};
use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Read;

/// Federative unit numeric codes (IBGE), one per Brazilian state plus DF.
const UF_CODES: [(&str, u16); 27] = [
    ("AC", 12), ("AL", 27), ("AM", 13), ("AP", 16), ("BA", 29), ("CE", 23),
    ("DF", 53), ("ES", 32), ("GO", 52), ("MA", 21), ("MG", 31), ("MS", 50),
    ("MT", 51), ("PA", 15), ("PB", 25), ("PE", 26), ("PI", 22), ("PR", 41),
    ("RJ", 33), ("RN", 24), ("RO", 11), ("RR", 14), ("RS", 43), ("SC", 42),
    ("SE", 28), ("SP", 35), ("TO", 17),
];

/// Maps a federative unit to its numeric code. Unknown units are a hard
/// validation error; the request is never built with a guessed code.
pub fn uf_code(uf: &str) -> Result<u16> {
    let upper = uf.to_ascii_uppercase();
    UF_CODES
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, code)| *code)
        .ok_or_else(|| EngineError::Config(format!("unknown federative unit: {}", uf)))
}

/// Renders an NSU cursor as the 15-digit zero-padded wire form.
pub fn pad_nsu(nsu: u64) -> String {
    format!("{:015}", nsu)
}

/// A 44-digit access key is the only valid document identity.
pub fn validate_access_key(key: &str) -> Result<()> {
    if key.len() == 44 && key.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "invalid access key (expected 44 digits): {}",
            key
        )))
    }
}

/// Document model from the access key, positions 20..22 ("55" or "65").
pub fn model_from_key(key: &str) -> &str {
    key.get(20..22).unwrap_or("55")
}

/// Document number embedded in the access key, positions 25..34.
pub fn number_from_key(key: &str) -> &str {
    key.get(25..34).unwrap_or("")
}

/// Builds the distNSU pagination envelope (NT 2014.002). The cursor is
/// the highest NSU already consumed; SEFAZ returns strictly newer items.
pub fn build_distribution_request(
    cnpj: &str,
    uf: &str,
    environment: Environment,
    nsu: u64,
) -> Result<String> {
    let cuf = uf_code(uf)?;
    Ok(format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap12:Envelope xmlns:soap12="http://www.w3.org/2003/05/soap-envelope"
                 xmlns:nfe="http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe">
  <soap12:Body>
    <nfe:nfeDistDFeInteresse>
      <nfe:nfeDadosMsg>
        <distDFeInt xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01">
          <tpAmb>{}</tpAmb>
          <cUFAutor>{}</cUFAutor>
          <CNPJ>{}</CNPJ>
          <distNSU><ultNSU>{}</ultNSU></distNSU>
        </distDFeInt>
      </nfe:nfeDadosMsg>
    </nfe:nfeDistDFeInteresse>
  </soap12:Body>
</soap12:Envelope>"#,
        environment.indicator(),
        cuf,
        cnpj,
        pad_nsu(nsu)
    ))
}

/// Builds the consChNFe envelope (NT 2014.002 §3.6) used to upgrade a
/// summary into the complete document by its access key.
pub fn build_key_lookup_request(
    cnpj: &str,
    uf: &str,
    environment: Environment,
    access_key: &str,
) -> Result<String> {
    validate_access_key(access_key)?;
    let cuf = uf_code(uf)?;
    Ok(format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap12:Envelope
    xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
    xmlns:xsd="http://www.w3.org/2001/XMLSchema"
    xmlns:soap12="http://www.w3.org/2003/05/soap-envelope">
  <soap12:Header>
    <nfeCabecMsg xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe">
      <cUF>91</cUF>
      <versaoDados>1.01</versaoDados>
    </nfeCabecMsg>
  </soap12:Header>
  <soap12:Body>
    <nfeDistDFeInteresse xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe">
      <nfeDadosMsg>
        <distDFeInt xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01">
          <tpAmb>{}</tpAmb>
          <cUFAutor>{}</cUFAutor>
          <CNPJ>{}</CNPJ>
          <consChNFe>
            <chNFe>{}</chNFe>
          </consChNFe>
        </distDFeInt>
      </nfeDadosMsg>
    </nfeDistDFeInteresse>
  </soap12:Body>
</soap12:Envelope>"#,
        environment.indicator(),
        cuf,
        cnpj,
        access_key
    ))
}

/// Builds the recipient-manifestation envelope (NFeRecepcaoEvento v4.00,
/// NT 2020.001). Event 210240 requires a justification of at least 15
/// characters. Digital signature of the event is handled outside the
/// codec, at the credential boundary.
pub fn build_manifest_request(
    cnpj: &str,
    access_key: &str,
    event_type: &str,
    environment: Environment,
    justification: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String> {
    validate_access_key(access_key)?;
    if event_type == crate::constants::EVENT_NOT_PERFORMED {
        match justification {
            Some(j) if j.len() >= 15 => {}
            _ => {
                return Err(EngineError::Config(
                    "event 210240 requires a justification of at least 15 characters".to_string(),
                ))
            }
        }
    }

    // Event timestamps are expressed in Brasília time (UTC-3, no DST).
    let brasilia = FixedOffset::west_opt(3 * 3600).expect("fixed offset");
    let event_time = now.with_timezone(&brasilia).format("%Y-%m-%dT%H:%M:%S%:z");

    // Event id: "ID" + event type + access key + 2-digit sequence.
    let event_id = format!("ID{}{}01", event_type, access_key);
    let description = crate::constants::event_description(event_type);
    let justification_xml = justification
        .map(|j| format!("<xJust>{}</xJust>", j))
        .unwrap_or_default();

    Ok(format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap12:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
                 xmlns:xsd="http://www.w3.org/2001/XMLSchema"
                 xmlns:soap12="http://www.w3.org/2003/05/soap-envelope">
  <soap12:Body>
    <nfeDadosMsg xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeRecepcaoEvento4">
      <envEvento xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.00">
        <idLote>1</idLote>
        <evento xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.00">
          <infEvento Id="{}">
            <cOrgao>91</cOrgao>
            <tpAmb>{}</tpAmb>
            <CNPJ>{}</CNPJ>
            <chNFe>{}</chNFe>
            <dhEvento>{}</dhEvento>
            <tpEvento>{}</tpEvento>
            <nSeqEvento>1</nSeqEvento>
            <verEvento>1.00</verEvento>
            <detEvento versao="1.00">
              <descEvento>{}</descEvento>{}
            </detEvento>
          </infEvento>
        </evento>
      </envEvento>
    </nfeDadosMsg>
  </soap12:Body>
</soap12:Envelope>"#,
        event_id,
        environment.indicator(),
        cnpj,
        access_key,
        event_time,
        event_type,
        description,
        justification_xml
    ))
}

/// One compressed document envelope from a distribution batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DocEnvelope {
    pub nsu: u64,
    pub schema: String,
    /// gzip+base64 payload as received.
    pub payload: String,
}

/// Parsed retDistDFeInt contents.
#[derive(Debug, Clone)]
pub struct DistributionResponse {
    pub c_stat: u16,
    pub message: String,
    pub last_nsu: Option<u64>,
    pub max_nsu: Option<u64>,
    pub docs: Vec<DocEnvelope>,
}

/// Parsed retEvento contents for a manifestation submission.
#[derive(Debug, Clone)]
pub struct ManifestReceipt {
    pub c_stat: u16,
    pub message: String,
    pub protocol: Option<String>,
    pub registered_at: Option<DateTime<Utc>>,
}

/// Returns the text of the first element with the given local name,
/// ignoring namespace prefixes.
pub fn first_text(xml: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == name.as_bytes() {
                    inside = true;
                }
            }
            Ok(Event::Text(t)) if inside => {
                return t.unescape().ok().map(|s| s.into_owned());
            }
            Ok(Event::End(e)) => {
                if inside && e.local_name().as_ref() == name.as_bytes() {
                    // Empty element
                    return Some(String::new());
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

fn parse_u16(value: &str) -> Option<u16> {
    value.trim().parse().ok()
}

fn parse_nsu_field(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        trimmed.parse().ok()
    }
}

/// Parses a NFeDistribuicaoDFe SOAP response body. A response without a
/// status code is malformed.
pub fn parse_distribution_response(xml: &str) -> Result<DistributionResponse> {
    let c_stat = first_text(xml, "cStat")
        .and_then(|v| parse_u16(&v))
        .ok_or_else(|| EngineError::Decode("response carries no cStat".to_string()))?;
    let message = first_text(xml, "xMotivo").unwrap_or_default();
    let last_nsu = first_text(xml, "ultNSU").and_then(|v| parse_nsu_field(&v));
    let max_nsu = first_text(xml, "maxNSU").and_then(|v| parse_nsu_field(&v));

    let mut docs = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut current: Option<DocEnvelope> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"docZip" => {
                let mut nsu = 0u64;
                let mut schema = String::new();
                for attr in e.attributes().flatten() {
                    let key = attr.key.local_name();
                    let value = attr
                        .unescape_value()
                        .map_err(|e| EngineError::Decode(e.to_string()))?;
                    match key.as_ref() {
                        b"NSU" => nsu = value.trim().parse().unwrap_or(0),
                        b"schema" => schema = value.into_owned(),
                        _ => {}
                    }
                }
                current = Some(DocEnvelope { nsu, schema, payload: String::new() });
            }
            Ok(Event::Text(t)) => {
                if let Some(doc) = current.as_mut() {
                    doc.payload = t
                        .unescape()
                        .map_err(|e| EngineError::Decode(e.to_string()))?
                        .trim()
                        .to_string();
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"docZip" => {
                if let Some(doc) = current.take() {
                    docs.push(doc);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(EngineError::Decode(format!("malformed envelope: {}", e))),
            _ => {}
        }
    }

    Ok(DistributionResponse { c_stat, message, last_nsu, max_nsu, docs })
}

/// Parses a NFeRecepcaoEvento response. Reads only fields inside
/// infEvento, since the outer batch element carries its own cStat.
pub fn parse_manifest_response(xml: &str) -> Result<ManifestReceipt> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut in_inf_evento = false;
    let mut field: Option<&'static str> = None;
    let mut c_stat: Option<u16> = None;
    let mut message = String::new();
    let mut protocol: Option<String> = None;
    let mut registered_at: Option<DateTime<Utc>> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"infEvento" => in_inf_evento = true,
                b"cStat" if in_inf_evento => field = Some("cStat"),
                b"xMotivo" if in_inf_evento => field = Some("xMotivo"),
                b"nProt" if in_inf_evento => field = Some("nProt"),
                b"dhRegEvento" if in_inf_evento => field = Some("dhRegEvento"),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let Some(name) = field.take() {
                    let value = t
                        .unescape()
                        .map_err(|e| EngineError::Decode(e.to_string()))?
                        .into_owned();
                    match name {
                        "cStat" => c_stat = parse_u16(&value),
                        "xMotivo" => message = value,
                        "nProt" => protocol = Some(value),
                        "dhRegEvento" => {
                            registered_at = DateTime::parse_from_rfc3339(value.trim())
                                .ok()
                                .map(|dt| dt.with_timezone(&Utc));
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"infEvento" => {
                in_inf_evento = false;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(EngineError::Decode(format!("malformed envelope: {}", e))),
            _ => {}
        }
    }

    let c_stat = c_stat
        .ok_or_else(|| EngineError::Decode("event response carries no cStat".to_string()))?;
    Ok(ManifestReceipt { c_stat, message, protocol, registered_at })
}

/// Decompresses a docZip payload: base64 then gzip. Some responses are
/// observed uncompressed, so a failed gunzip falls back to treating the
/// payload as plain base64 text.
pub fn decompress_payload(payload: &str) -> Result<String> {
    let compacted: String = payload.split_whitespace().collect();
    let bytes = BASE64
        .decode(compacted.as_bytes())
        .map_err(|e| EngineError::Decode(format!("payload is not valid base64: {}", e)))?;

    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut text = String::new();
    match decoder.read_to_string(&mut text) {
        Ok(_) => Ok(text),
        Err(_) => String::from_utf8(bytes)
            .map_err(|e| EngineError::Decode(format!("payload is neither gzip nor UTF-8: {}", e))),
    }
}

/// Document schemas delivered by the distribution service (NT 2014.002
/// §3.3). SEFAZ tags them by bare schema file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocSchema {
    /// Complete document (nfeProc).
    Full,
    /// Summary notification (resNFe).
    Summary,
    /// Complete event (procEventoNFe).
    Event,
    /// Event summary (resEvento).
    EventSummary,
    Unknown,
}

pub fn classify_schema(schema: &str) -> DocSchema {
    let lower = schema.to_ascii_lowercase();
    // Event schema first: "procEventoNFe" must not match the full-document arm
    if lower.contains("proceventonfe") {
        DocSchema::Event
    } else if lower.contains("procnfe") || lower.contains("nfeproc") {
        DocSchema::Full
    } else if lower.contains("resnfe") {
        DocSchema::Summary
    } else if lower.contains("resevento") {
        DocSchema::EventSummary
    } else {
        DocSchema::Unknown
    }
}

/// Legal-status code table for lookup-by-key results.
/// 217 ("not found") has no legal status and maps to None.
pub fn legal_status_from_code(code: u16) -> Option<NfeStatus> {
    match code {
        100 | 138 => Some(NfeStatus::Authorized),
        101 | 653 => Some(NfeStatus::Cancelled),
        110 | 301 | 302 => Some(NfeStatus::Denied),
        _ => None,
    }
}
