//! Range source loading.
//!
//! This module turns a source locator (a local path or an `http(s)://` URL)
//! into a list of network prefixes:
//! - Downloading with ETag-based conditional requests (304 Not Modified)
//! - Transparent gzip decompression
//! - `text` and `csv` entry formats
//! - Bare addresses normalized to single-address prefixes

use flate2::read::GzDecoder;
use ipnet::IpNet;
use serde::Deserialize;
use std::borrow::Cow;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::str::FromStr;

use crate::{Error, Result};

/// Layout of a range source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// One entry per line; blank lines and `#` comments are skipped.
    #[default]
    Text,
    /// The first field of each record is the entry.
    Csv,
}

impl SourceFormat {
    /// Get the config name of this format.
    pub fn name(&self) -> &'static str {
        match self {
            SourceFormat::Text => "text",
            SourceFormat::Csv => "csv",
        }
    }
}

impl FromStr for SourceFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" | "plain" => Ok(SourceFormat::Text),
            "csv" => Ok(SourceFormat::Csv),
            _ => Err(Error::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Turn a source entry into CIDR notation.
///
/// A bare IPv4 address gets `/32`, a bare IPv6 address `/128`, and an entry
/// that already has a prefix length is returned unchanged. The entry is not
/// validated here.
pub fn normalize_entry(entry: &str) -> Cow<'_, str> {
    if entry.contains('/') {
        Cow::Borrowed(entry)
    } else if entry.contains(':') {
        Cow::Owned(format!("{}/128", entry))
    } else if entry.contains('.') {
        Cow::Owned(format!("{}/32", entry))
    } else {
        Cow::Borrowed(entry)
    }
}

/// Parse a single source entry into a prefix.
pub fn parse_entry(entry: &str) -> Option<IpNet> {
    normalize_entry(entry).parse().ok()
}

/// Parse every entry of a source.
///
/// The first entry that does not parse aborts the load with
/// [`Error::InvalidPrefix`] naming its 1-based line number.
pub fn parse_prefixes<R: Read>(reader: R, format: SourceFormat) -> Result<Vec<IpNet>> {
    match format {
        SourceFormat::Text => parse_text(reader),
        SourceFormat::Csv => parse_csv(reader),
    }
}

fn push_entry(prefixes: &mut Vec<IpNet>, entry: &str, line: usize) -> Result<()> {
    if entry.is_empty() {
        return Ok(());
    }
    match parse_entry(entry) {
        Some(net) => {
            prefixes.push(net);
            Ok(())
        }
        None => Err(Error::InvalidPrefix {
            line,
            entry: normalize_entry(entry).into_owned(),
        }),
    }
}

fn parse_text<R: Read>(reader: R) -> Result<Vec<IpNet>> {
    let mut prefixes = Vec::new();
    for (idx, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        push_entry(&mut prefixes, text_entry(&line), idx + 1)?;
    }
    Ok(prefixes)
}

fn text_entry(line: &str) -> &str {
    let line = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    line.trim()
}

/// Records may span lines inside quoted fields; only the first field is used.
fn parse_csv<R: Read>(reader: R) -> Result<Vec<IpNet>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut prefixes = Vec::new();
    let mut record = csv::StringRecord::new();
    while rdr.read_record(&mut record)? {
        let line = record.position().map_or(0, |pos| pos.line() as usize);
        push_entry(&mut prefixes, record.get(0).unwrap_or(""), line)?;
    }
    Ok(prefixes)
}

/// Result of a conditional fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The source was read and parsed.
    Updated(Vec<IpNet>),
    /// The server answered 304 for the last seen ETag.
    NotModified,
}

/// Fetches and parses one range source.
///
/// Remembers the ETag of the last successful download so periodic re-fetches
/// of an unchanged URL skip the rebuild.
///
/// # Example
///
/// ```ignore
/// use rangegate::source::{SourceFetcher, SourceFormat};
///
/// let mut fetcher = SourceFetcher::new("https://example.com/blocklist.txt", SourceFormat::Text);
/// let prefixes = fetcher.load()?;
/// ```
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    locator: String,
    format: SourceFormat,
    etag: Option<String>,
}

impl SourceFetcher {
    /// Create a fetcher for a path or `http(s)://` URL.
    pub fn new(locator: &str, format: SourceFormat) -> Self {
        Self {
            locator: locator.to_string(),
            format,
            etag: None,
        }
    }

    /// Fetch and parse the source unconditionally.
    pub fn load(&mut self) -> Result<Vec<IpNet>> {
        let raw = self.read_raw(false)?.unwrap_or_default();
        self.parse(raw)
    }

    /// Fetch the source, skipping the parse when a URL reports 304.
    pub fn fetch(&mut self) -> Result<FetchOutcome> {
        match self.read_raw(true)? {
            Some(raw) => Ok(FetchOutcome::Updated(self.parse(raw)?)),
            None => Ok(FetchOutcome::NotModified),
        }
    }

    /// Get the source locator.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Get the source format.
    pub fn format(&self) -> SourceFormat {
        self.format
    }

    /// Get the current ETag (if any).
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn is_remote(&self) -> bool {
        self.locator.starts_with("http://") || self.locator.starts_with("https://")
    }

    fn parse(&self, raw: Vec<u8>) -> Result<Vec<IpNet>> {
        let data = decompress(raw)?;
        let prefixes = parse_prefixes(&data[..], self.format)?;
        log::debug!("Parsed {} prefixes from {}", prefixes.len(), self.locator);
        Ok(prefixes)
    }

    /// Returns `None` only for a conditional request answered with 304.
    fn read_raw(&mut self, conditional: bool) -> Result<Option<Vec<u8>>> {
        if !self.is_remote() {
            return Ok(Some(fs::read(&self.locator)?));
        }

        let mut request = ureq::get(&self.locator);
        if conditional {
            if let Some(ref etag) = self.etag {
                request = request.set("If-None-Match", etag);
            }
        }

        let response = request.call().map_err(|e| match e {
            ureq::Error::Status(code, _) => Error::Download(format!("HTTP error: {}", code)),
            ureq::Error::Transport(t) => Error::Download(format!("transport error: {}", t)),
        })?;

        if response.status() == 304 {
            log::debug!("Source not modified (304): {}", self.locator);
            return Ok(None);
        }

        let etag = response.header("ETag").map(str::to_string);

        let mut raw = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut raw)
            .map_err(|e| Error::Download(format!("failed to read response: {}", e)))?;

        // Only remember the ETag once the body made it here intact
        self.etag = etag;
        Ok(Some(raw))
    }
}

/// Check if data is gzip compressed.
fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

fn decompress(raw: Vec<u8>) -> Result<Vec<u8>> {
    if !is_gzip(&raw) {
        return Ok(raw);
    }
    let mut decoder = GzDecoder::new(&raw[..]);
    let mut data = Vec::new();
    decoder.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn nets(entries: &[&str]) -> Vec<IpNet> {
        entries.iter().map(|e| e.parse().unwrap()).collect()
    }

    #[test]
    fn test_normalize_entry() {
        assert_eq!(normalize_entry("10.0.0.1"), "10.0.0.1/32");
        assert_eq!(normalize_entry("2001:db8::1"), "2001:db8::1/128");
        assert_eq!(normalize_entry("10.0.0.0/8"), "10.0.0.0/8");
        assert_eq!(normalize_entry("garbage"), "garbage");
    }

    #[test]
    fn test_parse_entry() {
        assert_eq!(parse_entry("192.168.1.5"), Some("192.168.1.5/32".parse().unwrap()));
        assert_eq!(parse_entry("::1"), Some("::1/128".parse().unwrap()));
        assert!(parse_entry("10.0.0.0/33").is_none());
        assert!(parse_entry("not-an-ip").is_none());
    }

    #[test]
    fn test_parse_text_format() {
        let input = "# blocklist\n10.0.0.0/24\n\n  192.168.1.5  # single host\n2001:db8::/32\n";
        let prefixes = parse_prefixes(input.as_bytes(), SourceFormat::Text).unwrap();
        assert_eq!(
            prefixes,
            nets(&["10.0.0.0/24", "192.168.1.5/32", "2001:db8::/32"])
        );
    }

    #[test]
    fn test_parse_csv_format() {
        let input = "10.0.0.0/24,office\n\"192.168.1.5\",vpn\n\n2001:db8::1\n";
        let prefixes = parse_prefixes(input.as_bytes(), SourceFormat::Csv).unwrap();
        assert_eq!(
            prefixes,
            nets(&["10.0.0.0/24", "192.168.1.5/32", "2001:db8::1/128"])
        );
    }

    #[test]
    fn test_parse_csv_quoted_fields() {
        let input = concat!(
            "10.0.0.0/24,\"office\nnetwork\"\n",
            "192.168.1.5,\"vpn, backup\"\n",
            "\"172.16.0.0/12\"\n",
        );
        let prefixes = parse_prefixes(input.as_bytes(), SourceFormat::Csv).unwrap();
        assert_eq!(
            prefixes,
            nets(&["10.0.0.0/24", "192.168.1.5/32", "172.16.0.0/12"])
        );
    }

    #[test]
    fn test_parse_csv_error_names_record_line() {
        let input = "10.0.0.0/24,\"multi\nline\"\nbogus,x\n";
        match parse_prefixes(input.as_bytes(), SourceFormat::Csv) {
            Err(Error::InvalidPrefix { line, entry }) => {
                assert_eq!(line, 3);
                assert_eq!(entry, "bogus");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_names_line() {
        let input = "10.0.0.0/24\n10.0.0.300\n";
        match parse_prefixes(input.as_bytes(), SourceFormat::Text) {
            Err(Error::InvalidPrefix { line, entry }) => {
                assert_eq!(line, 2);
                assert_eq!(entry, "10.0.0.300/32");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_source_format_from_str() {
        assert_eq!("CSV".parse::<SourceFormat>().unwrap(), SourceFormat::Csv);
        assert_eq!("text".parse::<SourceFormat>().unwrap(), SourceFormat::Text);
        assert!("xml".parse::<SourceFormat>().is_err());
    }

    #[test]
    fn test_is_gzip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"10.0.0.0/8\n").unwrap();
        let gz = encoder.finish().unwrap();

        assert!(is_gzip(&gz));
        assert!(!is_gzip(b"10.0.0.0/8\n"));
        assert_eq!(decompress(gz).unwrap(), b"10.0.0.0/8\n");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.0/24").unwrap();
        writeln!(file, "192.168.1.5").unwrap();

        let mut fetcher = SourceFetcher::new(file.path().to_str().unwrap(), SourceFormat::Text);
        assert_eq!(fetcher.load().unwrap().len(), 2);

        match fetcher.fetch().unwrap() {
            FetchOutcome::Updated(prefixes) => assert_eq!(prefixes.len(), 2),
            FetchOutcome::NotModified => panic!("local files are always re-read"),
        }
        assert!(fetcher.etag().is_none());
    }

    #[test]
    fn test_load_gzip_file() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"10.0.0.0/24,a\n172.16.0.1,b\n").unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&encoder.finish().unwrap()).unwrap();

        let mut fetcher = SourceFetcher::new(file.path().to_str().unwrap(), SourceFormat::Csv);
        assert_eq!(
            fetcher.load().unwrap(),
            nets(&["10.0.0.0/24", "172.16.0.1/32"])
        );
    }

    #[test]
    fn test_missing_file_is_error() {
        let mut fetcher =
            SourceFetcher::new("/nonexistent/rangegate/source.txt", SourceFormat::Text);
        assert!(matches!(fetcher.load(), Err(Error::Io(_))));
    }

    #[test]
    fn test_is_remote() {
        assert!(SourceFetcher::new("https://example.com/a.txt", SourceFormat::Text).is_remote());
        assert!(SourceFetcher::new("http://example.com/a.txt", SourceFormat::Text).is_remote());
        assert!(!SourceFetcher::new("/etc/ranges.txt", SourceFormat::Text).is_remote());
    }
}
