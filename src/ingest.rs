// Certificate ingestion pipeline.
//
// Parses PKCS#12 bundles from the drop zone, guessing the password from the
// filename, and reconciles the catalog by (SHA-1, serial, name). When the
// in-process parser rejects every candidate password the system OpenSSL CLI
// is tried (modern, then legacy provider) to recover metadata from its
// textual output.

use crate::db::certificates::{self, Certificate, CertificateMetadata};
use crate::error::ApiError;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::x509::X509Ref;
use regex::Regex;
use serde::Serialize;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const CERT_EXTENSIONS: [&str; 2] = ["pfx", "p12"];
const MAX_ERRORS: usize = 50;
const OPENSSL_DATE_FORMAT: &str = "%b %d %H:%M:%S %Y";

static PASSWORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    // "senha" followed by a separator (colon, equals, underscore, dash or
    // whitespace) and the password as the final token of the stem.
    Regex::new(r"(?i)senha(?:\s*[:=_-]?\s+|\s*[:=_-]\s*)(\S+)$").expect("valid pattern")
});

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("{0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of parsing a single drop-zone file.
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    pub path: PathBuf,
    pub name: String,
    pub metadata: CertificateMetadata,
    pub password_used: Option<String>,
    pub parse_error: Option<String>,
}

/// Whether the given path has a certificate bundle extension.
pub fn is_certificate_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CERT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Extracts the password suffix after the "senha" marker in a filename stem.
pub fn guess_password_from_stem(stem: &str) -> Option<String> {
    PASSWORD_PATTERN
        .captures(stem)
        .map(|captures| captures[1].trim().to_string())
}

/// Password inferred from a full path (payload delivery uses this too).
pub fn guess_password_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    guess_password_from_stem(stem)
}

fn password_variations(password: &str) -> Vec<String> {
    let mut variations = vec![password.to_string(), password.trim().to_string()];
    for quote in ['"', '\''] {
        variations.push(password.trim().trim_matches(quote).to_string());
    }
    let mut deduped = Vec::new();
    for value in variations {
        if !value.is_empty() && !deduped.contains(&value) {
            deduped.push(value);
        }
    }
    deduped
}

/// Ordered candidate passwords for a file: filename-derived variants first,
/// then the empty password.
pub fn candidate_passwords(path: &Path) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(guessed) = guess_password_from_path(path) {
        candidates.extend(password_variations(&guessed));
    }
    candidates.push(String::new());
    candidates
}

/// Formats a big-endian serial in the .NET byte-reversed uppercase hex form
/// used by agent thumbprint interop.
pub fn dotnet_serial_from_bytes(big_endian: &[u8]) -> String {
    if big_endian.is_empty() {
        return "00".to_string();
    }
    let reversed: Vec<u8> = big_endian.iter().rev().copied().collect();
    hex::encode_upper(reversed)
}

/// Normalizes a serial as printed by the OpenSSL CLI (`serial=...`).
pub fn normalize_serial(raw: &str) -> Option<String> {
    let cleaned = raw.trim();
    let cleaned = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(cleaned);
    if cleaned.is_empty() {
        return None;
    }

    if cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        let padded = if cleaned.len() % 2 == 1 {
            format!("0{cleaned}")
        } else {
            cleaned.to_string()
        };
        let bytes = hex::decode(&padded).ok()?;
        let trimmed: Vec<u8> = {
            let stripped: Vec<u8> = bytes.iter().skip_while(|b| **b == 0).copied().collect();
            if stripped.is_empty() { vec![0] } else { stripped }
        };
        return Some(dotnet_serial_from_bytes(&trimmed));
    }

    // Decimal fallback
    let value: u128 = cleaned.parse().ok()?;
    let be = value.to_be_bytes();
    let stripped: Vec<u8> = be.iter().skip_while(|b| **b == 0).copied().collect();
    let bytes = if stripped.is_empty() { vec![0] } else { stripped };
    Some(dotnet_serial_from_bytes(&bytes))
}

fn x509_name_string(name: &openssl::x509::X509NameRef) -> String {
    // RFC 4514 renders RDNs most-specific first, the reverse of ASN.1 order.
    let mut parts: Vec<String> = name
        .entries()
        .map(|entry| {
            let key = entry
                .object()
                .nid()
                .short_name()
                .unwrap_or("UNKNOWN")
                .to_string();
            let value = entry
                .data()
                .as_utf8()
                .map(|v| v.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect();
    parts.reverse();
    parts.join(",")
}

fn asn1_time_to_utc(time: &openssl::asn1::Asn1TimeRef) -> Option<DateTime<Utc>> {
    let epoch = openssl::asn1::Asn1Time::from_unix(0).ok()?;
    let diff = epoch.diff(time).ok()?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(seconds, 0)
}

fn metadata_from_x509(cert: &X509Ref) -> Result<CertificateMetadata, ParserError> {
    let serial_bytes = cert
        .serial_number()
        .to_bn()
        .map(|bn| bn.to_vec())
        .map_err(|e| ParserError::Parse(format!("unreadable serial: {e}")))?;
    let fingerprint = cert
        .digest(MessageDigest::sha1())
        .map_err(|e| ParserError::Parse(format!("unable to fingerprint: {e}")))?;

    Ok(CertificateMetadata {
        subject: Some(x509_name_string(cert.subject_name())),
        issuer: Some(x509_name_string(cert.issuer_name())),
        serial_number: Some(dotnet_serial_from_bytes(&serial_bytes)),
        not_before: asn1_time_to_utc(cert.not_before()),
        not_after: asn1_time_to_utc(cert.not_after()),
        sha1_fingerprint: Some(hex::encode_upper(fingerprint.as_ref())),
    })
}

/// In-process PKCS#12 parse with one candidate password.
pub fn parse_pkcs12_bytes(der: &[u8], password: &str) -> Result<CertificateMetadata, ParserError> {
    let pkcs12 =
        Pkcs12::from_der(der).map_err(|e| ParserError::Parse(format!("not a PKCS12 file: {e}")))?;
    let parsed = pkcs12
        .parse2(password)
        .map_err(|e| ParserError::Parse(format!("unable to open PKCS12 bundle: {e}")))?;
    let cert = parsed
        .cert
        .ok_or_else(|| ParserError::Parse("certificate not found in PKCS12 bundle".to_string()))?;
    metadata_from_x509(&cert)
}

fn parse_openssl_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed
        .strip_suffix(" GMT")
        .or_else(|| collapsed.strip_suffix(" UTC"))
        .unwrap_or(&collapsed);
    NaiveDateTime::parse_from_str(trimmed, OPENSSL_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Recovers metadata from `openssl x509 -noout -subject -issuer ...` output.
pub fn parse_metadata_output(raw_output: &str) -> CertificateMetadata {
    let mut meta = CertificateMetadata::default();
    for line in raw_output.lines() {
        if let Some(rest) = line.strip_prefix("subject=") {
            meta.subject = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("issuer=") {
            meta.issuer = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("serial=") {
            meta.serial_number = normalize_serial(rest);
        } else if let Some(rest) = line.strip_prefix("notBefore=") {
            meta.not_before = parse_openssl_datetime(rest);
        } else if let Some(rest) = line.strip_prefix("notAfter=") {
            meta.not_after = parse_openssl_datetime(rest);
        } else if line.contains("Fingerprint=") {
            if let Some((_, value)) = line.split_once('=') {
                meta.sha1_fingerprint = Some(value.trim().replace(':', "").to_uppercase());
            }
        }
    }
    meta
}

async fn run_openssl_extract(
    openssl_path: &Path,
    path: &Path,
    password: &str,
    legacy: bool,
) -> Result<String, ParserError> {
    let mut pkcs12_cmd = tokio::process::Command::new(openssl_path);
    pkcs12_cmd
        .arg("pkcs12")
        .arg("-in")
        .arg(path)
        .arg("-passin")
        .arg(format!("pass:{password}"))
        .arg("-nokeys")
        .arg("-clcerts")
        .arg("-nodes");
    if legacy {
        pkcs12_cmd.arg("-legacy");
    }
    let pkcs12_out = pkcs12_cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if !pkcs12_out.status.success() {
        let stderr = String::from_utf8_lossy(&pkcs12_out.stderr).trim().to_string();
        return Err(ParserError::Parse(if stderr.is_empty() {
            "unable to parse certificate".to_string()
        } else {
            stderr
        }));
    }

    let mut x509_cmd = tokio::process::Command::new(openssl_path)
        .arg("x509")
        .arg("-noout")
        .arg("-subject")
        .arg("-issuer")
        .arg("-serial")
        .arg("-dates")
        .arg("-fingerprint")
        .arg("-sha1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(stdin) = x509_cmd.stdin.as_mut() {
        stdin.write_all(&pkcs12_out.stdout).await?;
    }
    let x509_out = x509_cmd.wait_with_output().await?;
    if !x509_out.status.success() {
        let stderr = String::from_utf8_lossy(&x509_out.stderr).trim().to_string();
        return Err(ParserError::Parse(if stderr.is_empty() {
            "unable to parse certificate".to_string()
        } else {
            stderr
        }));
    }

    Ok(String::from_utf8_lossy(&x509_out.stdout).to_string())
}

/// Tries every candidate password in-process, then falls back to the CLI.
pub async fn extract_metadata(path: &Path, openssl_path: &Path) -> ParsedCertificate {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let candidates = candidate_passwords(path);
    let mut last_error: Option<String> = None;

    match tokio::fs::read(path).await {
        Ok(raw_bytes) => {
            for password in &candidates {
                match parse_pkcs12_bytes(&raw_bytes, password) {
                    Ok(metadata) => {
                        return ParsedCertificate {
                            path: path.to_path_buf(),
                            name,
                            metadata,
                            password_used: Some(password.clone()).filter(|p| !p.is_empty()),
                            parse_error: None,
                        };
                    }
                    Err(e) => last_error = Some(e.to_string()),
                }
            }
        }
        Err(e) => last_error = Some(e.to_string()),
    }

    for password in &candidates {
        let output = match run_openssl_extract(openssl_path, path, password, false).await {
            Ok(output) => Some(output),
            Err(first_err) => {
                last_error = Some(first_err.to_string());
                match run_openssl_extract(openssl_path, path, password, true).await {
                    Ok(output) => Some(output),
                    Err(legacy_err) => {
                        last_error = Some(legacy_err.to_string());
                        None
                    }
                }
            }
        };
        if let Some(output) = output {
            return ParsedCertificate {
                path: path.to_path_buf(),
                name,
                metadata: parse_metadata_output(&output),
                password_used: Some(password.clone()).filter(|p| !p.is_empty()),
                parse_error: None,
            };
        }
    }

    ParsedCertificate {
        path: path.to_path_buf(),
        name,
        metadata: CertificateMetadata::default(),
        password_used: None,
        parse_error: Some(last_error.unwrap_or_else(|| "failed to parse certificate".to_string())),
    }
}

/// Per-file ingest outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestAction {
    Inserted,
    Updated,
    Failed,
}

/// One failed file in the batch report.
#[derive(Debug, Clone, Serialize)]
pub struct IngestFileError {
    pub filename: String,
    pub reason: Option<String>,
}

/// Batch ingest report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub total: usize,
    pub pruned: usize,
    pub deduped: usize,
    pub errors: Vec<IngestFileError>,
}

/// Batch ingest options.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub dry_run: bool,
    pub limit: usize,
    pub prune_missing: bool,
    pub dedupe: bool,
}

/// Ingests a single file, reconciling by (SHA-1, serial, name).
pub async fn ingest_certificate_from_path(
    pool: &PgPool,
    org_id: i32,
    path: &Path,
    openssl_path: &Path,
) -> Result<(IngestAction, Option<Uuid>, Option<String>), ApiError> {
    let parsed = extract_metadata(path, openssl_path).await;
    let source_path = path.to_string_lossy().to_string();
    let existing = certificates::find_for_reconciliation(
        pool,
        org_id,
        parsed.metadata.sha1_fingerprint.as_deref(),
        parsed.metadata.serial_number.as_deref(),
        &parsed.name,
    )
    .await?;

    if let Some(parse_error) = &parsed.parse_error {
        let cert_id = if let Some(existing) = &existing {
            certificates::mark_parse_failure(pool, existing.id, parse_error, &source_path).await?;
            Some(existing.id)
        } else {
            None
        };
        return Ok((IngestAction::Failed, cert_id, Some(parse_error.clone())));
    }

    let cert = match existing {
        Some(existing) => {
            let cert = certificates::update_parsed(
                pool,
                existing.id,
                &parsed.name,
                &source_path,
                &parsed.metadata,
            )
            .await?;
            (IngestAction::Updated, cert)
        }
        None => {
            let cert =
                certificates::insert_parsed(pool, org_id, &parsed.name, &source_path, &parsed.metadata)
                    .await?;
            (IngestAction::Inserted, cert)
        }
    };
    Ok((cert.0, Some(cert.1.id), None))
}

/// Scans the drop zone and ingests up to `limit` bundles, optionally pruning
/// rows whose source file disappeared and deduplicating by SHA-1 then serial.
pub async fn ingest_from_fs(
    pool: &PgPool,
    org_id: i32,
    root_path: &Path,
    openssl_path: &Path,
    options: &IngestOptions,
) -> Result<IngestReport, ApiError> {
    if !root_path.is_dir() {
        return Err(ApiError::Validation(format!(
            "CERTS_ROOT_PATH not found: {}",
            root_path.display()
        )));
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(root_path)
        .map_err(|e| ApiError::Internal(format!("unable to scan drop zone: {e}")))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_certificate_file(path))
        .collect();
    files.sort();
    if options.limit > 0 {
        files.truncate(options.limit);
    }

    let mut report = IngestReport {
        total: files.len(),
        ..IngestReport::default()
    };

    for path in &files {
        if options.dry_run {
            let parsed = extract_metadata(path, openssl_path).await;
            if parsed.parse_error.is_some() {
                report.failed += 1;
                push_error(&mut report, path, parsed.parse_error);
            } else {
                let existing = certificates::find_for_reconciliation(
                    pool,
                    org_id,
                    parsed.metadata.sha1_fingerprint.as_deref(),
                    parsed.metadata.serial_number.as_deref(),
                    &parsed.name,
                )
                .await?;
                if existing.is_some() {
                    report.updated += 1;
                } else {
                    report.inserted += 1;
                }
            }
            continue;
        }

        match ingest_certificate_from_path(pool, org_id, path, openssl_path).await? {
            (IngestAction::Inserted, _, _) => report.inserted += 1,
            (IngestAction::Updated, _, _) => report.updated += 1,
            (IngestAction::Failed, _, error) => {
                report.failed += 1;
                push_error(&mut report, path, error);
            }
        }
    }

    if !options.dry_run {
        if options.prune_missing {
            report.pruned = prune_missing(pool, org_id).await?;
        }
        if options.dedupe {
            report.deduped = dedupe(pool, org_id).await?;
        }
    }

    Ok(report)
}

fn push_error(report: &mut IngestReport, path: &Path, reason: Option<String>) {
    if report.errors.len() < MAX_ERRORS {
        report.errors.push(IngestFileError {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            reason,
        });
    }
}

/// Deletes rows whose `source_path` no longer exists on disk.
async fn prune_missing(pool: &PgPool, org_id: i32) -> Result<usize, ApiError> {
    let mut removed = 0;
    for cert in certificates::list_with_source_path(pool, org_id).await? {
        if let Some(source_path) = &cert.source_path {
            if !Path::new(source_path).exists()
                && certificates::delete_certificate(pool, cert.id).await?
            {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Retains the most recently ingested row per SHA-1 (then per serial when the
/// fingerprint is absent) and deletes the rest.
async fn dedupe(pool: &PgPool, org_id: i32) -> Result<usize, ApiError> {
    let certs = certificates::list_certificates(pool, org_id).await?;
    let duplicates = duplicate_ids(&certs);
    let mut removed = 0;
    for cert_id in duplicates {
        if certificates::delete_certificate(pool, cert_id).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Pure grouping step of [`dedupe`]: ids that lose to a newer row.
fn duplicate_ids(certs: &[Certificate]) -> Vec<Uuid> {
    use std::collections::HashMap;

    let mut by_sha1: HashMap<&str, Vec<&Certificate>> = HashMap::new();
    let mut by_serial: HashMap<&str, Vec<&Certificate>> = HashMap::new();
    for cert in certs {
        if let Some(sha1) = cert.sha1_fingerprint.as_deref() {
            by_sha1.entry(sha1).or_default().push(cert);
        } else if let Some(serial) = cert.serial_number.as_deref() {
            by_serial.entry(serial).or_default().push(cert);
        }
    }

    let mut losers = Vec::new();
    for group in by_sha1.into_values().chain(by_serial.into_values()) {
        if group.len() <= 1 {
            continue;
        }
        let mut sorted = group;
        sorted.sort_by_key(|cert| std::cmp::Reverse(cert.last_ingested_at));
        for duplicate in &sorted[1..] {
            if !losers.contains(&duplicate.id) {
                losers.push(duplicate.id);
            }
        }
    }
    losers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_password_variants() {
        assert_eq!(
            guess_password_from_stem("cliente_senha 1234").as_deref(),
            Some("1234")
        );
        assert_eq!(
            guess_password_from_stem("cliente senha:abc").as_deref(),
            Some("abc")
        );
        assert_eq!(
            guess_password_from_stem("cliente SENHA=secret").as_deref(),
            Some("secret")
        );
        assert_eq!(
            guess_password_from_stem("cliente senha-xy_z9").as_deref(),
            Some("xy_z9")
        );
        assert_eq!(guess_password_from_stem("cliente"), None);
    }

    #[test]
    fn test_guess_password_takes_final_token() {
        // Only the trailing token counts; "senha" mid-name with more words after
        // the candidate does not match.
        assert_eq!(
            guess_password_from_stem("acme senha: 99 backup"),
            None
        );
    }

    #[test]
    fn test_candidate_passwords_order_and_empty_fallback() {
        let path = Path::new("/certs/acme senha \"123\".pfx");
        let candidates = candidate_passwords(path);
        assert_eq!(candidates.first().map(String::as_str), Some("\"123\""));
        assert!(candidates.contains(&"123".to_string()));
        assert_eq!(candidates.last().map(String::as_str), Some(""));
    }

    #[test]
    fn test_candidate_passwords_without_marker() {
        let candidates = candidate_passwords(Path::new("/certs/plain.pfx"));
        assert_eq!(candidates, vec![String::new()]);
    }

    #[test]
    fn test_dotnet_serial_reverses_bytes() {
        // 0x0A1B2C big-endian -> reversed 2C 1B 0A
        assert_eq!(dotnet_serial_from_bytes(&[0x0A, 0x1B, 0x2C]), "2C1B0A");
        assert_eq!(dotnet_serial_from_bytes(&[0x01]), "01");
        assert_eq!(dotnet_serial_from_bytes(&[]), "00");
    }

    #[test]
    fn test_normalize_serial_hex_and_decimal() {
        assert_eq!(normalize_serial("0A1B2C").as_deref(), Some("2C1B0A"));
        assert_eq!(normalize_serial("0x0A1B2C").as_deref(), Some("2C1B0A"));
        // Odd-length hex gets a leading zero: 0xA1B -> 0A 1B -> 1B0A
        assert_eq!(normalize_serial("A1B").as_deref(), Some("1B0A"));
        // 255 decimal... but "255" is valid hex too, so hex wins: 0x0255 -> 5502
        assert_eq!(normalize_serial("255").as_deref(), Some("5502"));
        assert_eq!(normalize_serial(""), None);
    }

    #[test]
    fn test_parse_metadata_output() {
        let output = "subject=CN=Acme Ltda, O=Acme\n\
                      issuer=CN=AC Example RFB\n\
                      serial=0A1B2C\n\
                      notBefore=Jun  1 12:00:00 2025 GMT\n\
                      notAfter=Jun  1 12:00:00 2026 GMT\n\
                      SHA1 Fingerprint=AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD\n";
        let meta = parse_metadata_output(output);
        assert_eq!(meta.subject.as_deref(), Some("CN=Acme Ltda, O=Acme"));
        assert_eq!(meta.issuer.as_deref(), Some("CN=AC Example RFB"));
        assert_eq!(meta.serial_number.as_deref(), Some("2C1B0A"));
        assert_eq!(
            meta.sha1_fingerprint.as_deref(),
            Some("AABBCCDDEEFF00112233445566778899AABBCCDD")
        );
        let not_before = meta.not_before.unwrap();
        assert_eq!(not_before.format("%Y-%m-%d %H:%M").to_string(), "2025-06-01 12:00");
        assert!(meta.not_after.unwrap() > not_before);
    }

    #[test]
    fn test_is_certificate_file() {
        assert!(is_certificate_file(Path::new("/a/b.pfx")));
        assert!(is_certificate_file(Path::new("/a/b.P12")));
        assert!(!is_certificate_file(Path::new("/a/b.pem")));
        assert!(!is_certificate_file(Path::new("/a/pfx")));
    }

    #[test]
    fn test_parse_pkcs12_rejects_garbage() {
        let err = parse_pkcs12_bytes(b"definitely not a pfx", "").unwrap_err();
        assert!(err.to_string().contains("not a PKCS12 file"));
    }

    #[test]
    fn test_duplicate_ids_keeps_most_recent() {
        fn cert(sha1: Option<&str>, serial: Option<&str>, age_hours: i64) -> Certificate {
            let now = Utc::now();
            Certificate {
                id: Uuid::new_v4(),
                org_id: 1,
                name: format!("cert-{age_hours}"),
                subject: None,
                issuer: None,
                serial_number: serial.map(str::to_string),
                not_before: None,
                not_after: None,
                sha1_fingerprint: sha1.map(str::to_string),
                source_path: None,
                parse_ok: true,
                parse_error: None,
                last_ingested_at: Some(now - chrono::Duration::hours(age_hours)),
                last_error_at: None,
                created_at: now,
                updated_at: now,
            }
        }

        let newest = cert(Some("AABB"), None, 1);
        let older = cert(Some("AABB"), None, 5);
        let unrelated = cert(Some("CCDD"), None, 2);
        let losers = duplicate_ids(&[newest.clone(), older.clone(), unrelated]);
        assert_eq!(losers, vec![older.id]);

        // Serial grouping applies only when the fingerprint is absent.
        let serial_new = cert(None, Some("0102"), 1);
        let serial_old = cert(None, Some("0102"), 9);
        let losers = duplicate_ids(&[serial_new.clone(), serial_old.clone()]);
        assert_eq!(losers, vec![serial_old.id]);
    }
}
