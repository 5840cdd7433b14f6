use std::collections::HashSet;

use regex::Regex;

use crate::errors::Error;

/// Immutable configuration describing one registered reference dataset. The
/// `name` doubles as the document-store collection key.
#[derive(Debug, Clone)]
pub struct DatasetDefinition {
    pub name: String,
    /// Object key prefix with a `{0}` placeholder for the 14-digit timestamp,
    /// e.g. `LITP_KEEPERS_{0}`.
    pub file_prefix: String,
    /// strftime-compatible pattern the 14 digits are parsed under, e.g. `%Y%m%d%H%M%S`.
    pub date_pattern: String,
    pub primary_key_columns: Vec<String>,
    pub change_type_column: Option<String>,
    pub accumulator_columns: HashSet<String>,
}

/// Known object-key suffixes stripped before matching a dataset's filename
/// pattern: encrypted source objects end in `.csv.enc`, decrypted target
/// objects in `.csv`.
const KNOWN_SUFFIXES: &[&str] = &[".csv.enc", ".csv"];

impl DatasetDefinition {
    pub fn new(name: impl Into<String>, file_prefix: impl Into<String>, primary_key_columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            file_prefix: file_prefix.into(),
            date_pattern: "%Y%m%d%H%M%S".to_string(),
            primary_key_columns,
            change_type_column: Some("CHANGETYPE".to_string()),
            accumulator_columns: HashSet::new(),
        }
    }

    pub fn with_accumulators(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.accumulator_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_change_type_column(mut self, column: Option<impl Into<String>>) -> Self {
        self.change_type_column = column.map(Into::into);
        self
    }

    /// Regex matching a file name that belongs to this dataset: the prefix
    /// (with the `{0}` placeholder stripped) followed by exactly 14 digits,
    /// per `^<filePrefix-with-{0}-stripped><14-digit-datetime>$`.
    pub fn filename_pattern(&self) -> Result<Regex, Error> {
        let stripped = self.file_prefix.replace("{0}", "");
        let escaped = regex::escape(&stripped);
        Regex::new(&format!("^{escaped}(?P<ts>[0-9]{{14}})$"))
            .map_err(|err| Error::InputInvalid(format!("invalid file prefix for dataset {}: {err}", self.name)))
    }

    /// Parses the 14-digit timestamp captured out of a matching file name
    /// using this definition's `date_pattern`.
    pub fn parse_timestamp(&self, digits: &str) -> Result<chrono::NaiveDateTime, Error> {
        chrono::NaiveDateTime::parse_from_str(digits, &self.date_pattern)
            .map_err(|err| Error::InputInvalid(format!("could not parse timestamp {digits} for dataset {}: {err}", self.name)))
    }
}

/// Immutable map of dataset name -> definition, plus filename matching.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    definitions: Vec<DatasetDefinition>,
}

impl DatasetRegistry {
    pub fn new(definitions: Vec<DatasetDefinition>) -> Self {
        Self { definitions }
    }

    pub fn all(&self) -> &[DatasetDefinition] {
        &self.definitions
    }

    pub fn get(&self, name: &str) -> Option<&DatasetDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    /// Finds the definition (if any) whose filename pattern matches `file_name`,
    /// along with the parsed timestamp encoded in the name. `file_name` may
    /// carry either the `.csv.enc` (source) or `.csv` (target) suffix.
    pub fn match_filename(&self, file_name: &str) -> Option<(&DatasetDefinition, chrono::NaiveDateTime)> {
        let stem = strip_known_suffix(file_name);

        for def in &self.definitions {
            let Ok(pattern) = def.filename_pattern() else { continue };
            if let Some(caps) = pattern.captures(stem) {
                let digits = &caps["ts"];
                if let Ok(ts) = def.parse_timestamp(digits) {
                    return Some((def, ts));
                }
            }
        }
        None
    }
}

fn strip_known_suffix(file_name: &str) -> &str {
    for suffix in KNOWN_SUFFIXES {
        if let Some(stripped) = file_name.strip_suffix(suffix) {
            return stripped;
        }
    }
    file_name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepers() -> DatasetDefinition {
        DatasetDefinition::new("KEEPERS", "LITP_KEEPERS_{0}", vec!["KEEPER_ID".into()])
    }

    #[test]
    fn filename_pattern_matches_exact_prefix_and_digit_count() {
        let def = keepers();
        let pattern = def.filename_pattern().unwrap();
        assert!(pattern.is_match("LITP_KEEPERS_20241215120000"));
        assert!(!pattern.is_match("LITP_KEEPERS_2024121512000"));
        assert!(!pattern.is_match("LITP_OTHER_20241215120000"));
    }

    #[test]
    fn registry_matches_the_right_definition_among_several() {
        let registry = DatasetRegistry::new(vec![keepers(), DatasetDefinition::new("HOLDINGS", "LITP_HOLDINGS_{0}", vec!["CPH".into()])]);

        let (def, ts) = registry.match_filename("LITP_HOLDINGS_20241215120000.csv").unwrap();
        assert_eq!(def.name, "HOLDINGS");
        assert_eq!(ts.and_utc().to_rfc3339(), "2024-12-15T12:00:00+00:00");

        let (def_enc, _) = registry.match_filename("LITP_HOLDINGS_20241215120000.csv.enc").unwrap();
        assert_eq!(def_enc.name, "HOLDINGS");

        assert!(registry.match_filename("LITP_UNKNOWN_20241215120000.csv").is_none());
    }
}
