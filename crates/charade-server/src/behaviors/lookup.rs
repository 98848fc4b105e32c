//! Lookup behavior - substitute response tokens from a CSV data source.

use super::copy::{substitute_response, CopySource};
use super::extraction::ExtractionMethod;
use crate::model::ResolvedResponse;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

/// Lookup behavior: resolve a key from the request, find the CSV row whose
/// `keyColumn` equals the key, and replace `${TOKEN}[column]` tokens in the
/// response with the row's column values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupBehavior {
    /// Key extraction from the request
    pub key: LookupKey,
    /// Data source configuration
    #[serde(rename = "fromDataSource")]
    pub from_data_source: DataSource,
    /// Token prefix to replace (e.g. "${row}")
    pub into: String,
}

/// Copy-style key extraction for lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupKey {
    pub from: CopySource,
    #[serde(rename = "using")]
    pub extraction: ExtractionMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub csv: CsvDataSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvDataSource {
    pub path: String,
    #[serde(rename = "keyColumn")]
    pub key_column: String,
    /// Delimiter character (default ',')
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_delimiter() -> char {
    ','
}

struct CachedCsv {
    data: Arc<CsvData>,
    mtime: Option<SystemTime>,
}

/// Shared-read CSV cache keyed by path, invalidated when the file's mtime
/// changes.
#[derive(Default)]
pub struct CsvCache {
    files: RwLock<HashMap<String, CachedCsv>>,
}

impl CsvCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(&self, path: &str, delimiter: char) -> Option<Arc<CsvData>> {
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        {
            let cache = self.files.read();
            if let Some(entry) = cache.get(path) {
                if entry.mtime == mtime {
                    return Some(Arc::clone(&entry.data));
                }
            }
        }

        let data = Arc::new(CsvData::load(path, delimiter).ok()?);
        self.files.write().insert(
            path.to_string(),
            CachedCsv {
                data: Arc::clone(&data),
                mtime,
            },
        );
        Some(data)
    }

    pub fn clear(&self) {
        self.files.write().clear();
    }
}

/// Parsed CSV data: header row plus data rows.
pub struct CsvData {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvData {
    pub fn load<P: AsRef<Path>>(path: P, delimiter: char) -> Result<Self, std::io::Error> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty CSV"))??;
        let headers: Vec<String> = header_line
            .split(delimiter)
            .map(|s| s.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for line in lines {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            rows.push(
                line.split(delimiter)
                    .map(|s| s.trim().to_string())
                    .collect(),
            );
        }

        Ok(Self { headers, rows })
    }

    /// Find the row whose `key_column` value equals `key` and return its
    /// columns as `[column]` token replacements.
    pub fn lookup(&self, key: &str, key_column: &str) -> HashMap<String, String> {
        let mut result = HashMap::new();
        let Some(key_index) = self.headers.iter().position(|h| h == key_column) else {
            return result;
        };

        for row in &self.rows {
            if row.get(key_index).map(|v| v == key).unwrap_or(false) {
                for (i, header) in self.headers.iter().enumerate() {
                    if let Some(value) = row.get(i) {
                        result.insert(format!("[{header}]"), value.clone());
                    }
                }
                break;
            }
        }
        result
    }
}

/// Apply one lookup behavior against the response.
pub fn apply_lookup(
    response: &mut ResolvedResponse,
    behavior: &LookupBehavior,
    request_fields: &Value,
    cache: &CsvCache,
) {
    let key = behavior
        .key
        .from
        .extract(request_fields)
        .and_then(|source| behavior.key.extraction.extract_first(&source));
    let Some(key) = key else {
        return;
    };

    let source = &behavior.from_data_source.csv;
    let Some(csv) = cache.get_or_load(&source.path, source.delimiter) else {
        return;
    };

    for (column_token, value) in csv.lookup(&key, &source.key_column) {
        let full_token = format!("{}{}", behavior.into, column_token);
        substitute_response(response, &full_token, &value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn fixture_csv() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name,occupation,location").unwrap();
        writeln!(file, "liquid,tester,Bletchley").unwrap();
        writeln!(file, "mountain,mathematician,Cambridge").unwrap();
        file
    }

    fn behavior(path: &str) -> LookupBehavior {
        serde_json::from_value(json!({
            "key": {
                "from": "path",
                "using": {"method": "regex", "selector": "/people/(\\w+)"}
            },
            "fromDataSource": {
                "csv": {"path": path, "keyColumn": "name"}
            },
            "into": "${row}"
        }))
        .unwrap()
    }

    #[test]
    fn test_lookup_substitutes_columns() {
        let file = fixture_csv();
        let cache = CsvCache::new();
        let mut response = ResolvedResponse {
            body: Some(json!("${row}[occupation] of ${row}[location]")),
            ..Default::default()
        };
        apply_lookup(
            &mut response,
            &behavior(file.path().to_str().unwrap()),
            &json!({"path": "/people/liquid"}),
            &cache,
        );
        assert_eq!(response.body_text(), "tester of Bletchley");
    }

    #[test]
    fn test_lookup_unknown_key_leaves_tokens() {
        let file = fixture_csv();
        let cache = CsvCache::new();
        let mut response = ResolvedResponse {
            body: Some(json!("${row}[occupation]")),
            ..Default::default()
        };
        apply_lookup(
            &mut response,
            &behavior(file.path().to_str().unwrap()),
            &json!({"path": "/people/nobody"}),
            &cache,
        );
        assert_eq!(response.body_text(), "${row}[occupation]");
    }

    #[test]
    fn test_csv_lookup_by_non_first_column() {
        let file = fixture_csv();
        let csv = CsvData::load(file.path(), ',').unwrap();
        let row = csv.lookup("mathematician", "occupation");
        assert_eq!(row.get("[name]"), Some(&"mountain".to_string()));
    }

    #[test]
    fn test_cache_reloads_on_mtime_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name,value").unwrap();
        writeln!(file, "k,first").unwrap();
        file.flush().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cache = CsvCache::new();
        let csv = cache.get_or_load(&path, ',').unwrap();
        assert_eq!(csv.lookup("k", "name").get("[value]").unwrap(), "first");

        // rewrite with new content and a different mtime
        std::fs::write(&path, "name,value\nk,second\n").unwrap();
        let new_mtime = SystemTime::now() + std::time::Duration::from_secs(2);
        let dest = File::options().write(true).open(&path).unwrap();
        dest.set_modified(new_mtime).unwrap();

        let csv = cache.get_or_load(&path, ',').unwrap();
        assert_eq!(csv.lookup("k", "name").get("[value]").unwrap(), "second");
    }
}
