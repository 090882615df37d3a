use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaseFileError {
    #[error("Failed to read case file {path:?}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("Case batch is not a valid JSON array of records: {0}")]
    Malformed(String),
    #[error("Record {index} of the case batch is invalid: {reason}")]
    InvalidRecord { index: usize, reason: String },
    #[error("Case batch contains no test cases")]
    Empty,
}

impl From<serde_json::Error> for CaseFileError {
    fn from(err: serde_json::Error) -> Self {
        CaseFileError::Malformed(err.to_string())
    }
}

/// One candidate API call issued to the device.
///
/// Serialized field names follow the persisted batch format, so a `TestCase`
/// round-trips through case files and is sent on the wire in the same shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    #[serde(rename = "Test_Case")]
    pub number: u32,
    #[serde(rename = "API_Name")]
    pub api: String,
    #[serde(rename = "Function_Name")]
    pub function: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "Code_Snippets")]
    pub snippets: Vec<String>,
    #[serde(
        rename = "Pre-operation_Python",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pre_operation: Option<String>,
}

/// Loosely-typed record as it appears in a batch file, validated into a `TestCase`.
#[derive(Deserialize, Debug)]
struct RawTestCase {
    #[serde(rename = "Test_Case")]
    number: Option<serde_json::Value>,
    #[serde(rename = "API_Name")]
    api: Option<String>,
    #[serde(rename = "Function_Name")]
    function: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
    #[serde(rename = "Code_Snippets")]
    snippets: Option<Vec<String>>,
    #[serde(rename = "Pre-operation_Python")]
    pre_operation: Option<String>,
}

impl RawTestCase {
    fn validate(self, index: usize) -> Result<TestCase, CaseFileError> {
        let invalid = |reason: &str| CaseFileError::InvalidRecord {
            index,
            reason: reason.to_string(),
        };

        // Generators emit the number either as an integer or as a numeric string.
        let number = match self.number {
            Some(serde_json::Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| invalid("Test_Case must be a non-negative integer"))?,
            Some(serde_json::Value::String(s)) => s
                .trim()
                .parse::<u32>()
                .map_err(|_| invalid("Test_Case must be a non-negative integer"))?,
            Some(_) => return Err(invalid("Test_Case must be a non-negative integer")),
            None => return Err(invalid("missing Test_Case")),
        };
        let api = self
            .api
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid("missing or empty API_Name"))?;
        let function = self
            .function
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid("missing or empty Function_Name"))?;
        let snippets = self
            .snippets
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("missing or empty Code_Snippets"))?;

        Ok(TestCase {
            number,
            api,
            function,
            description: self.description.unwrap_or_default(),
            snippets,
            pre_operation: self.pre_operation.filter(|s| !s.trim().is_empty()),
        })
    }
}

impl TestCase {
    /// Encodes the case as a single newline-terminated JSON request.
    ///
    /// The whole case goes out in one write so its snippets are never
    /// interleaved with another case's.
    pub fn to_request_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Checks the batch-level invariants: non-empty and strictly increasing case numbers.
///
/// Issuance order is the segment alignment key, so it must agree with
/// sequence-number order.
pub fn validate_batch(cases: &[TestCase]) -> Result<(), CaseFileError> {
    if cases.is_empty() {
        return Err(CaseFileError::Empty);
    }
    for (index, pair) in cases.windows(2).enumerate() {
        if pair[1].number <= pair[0].number {
            return Err(CaseFileError::InvalidRecord {
                index: index + 1,
                reason: format!(
                    "Test_Case {} does not follow {} in increasing order",
                    pair[1].number, pair[0].number
                ),
            });
        }
    }
    for (index, case) in cases.iter().enumerate() {
        if case.snippets.is_empty() {
            return Err(CaseFileError::InvalidRecord {
                index,
                reason: "missing or empty Code_Snippets".to_string(),
            });
        }
    }
    Ok(())
}

/// Parses a JSON array of case records, preserving array order as execution order.
pub fn parse_batch(json: &str) -> Result<Vec<TestCase>, CaseFileError> {
    let raw: Vec<RawTestCase> = serde_json::from_str(json)?;
    let cases = raw
        .into_iter()
        .enumerate()
        .map(|(index, record)| record.validate(index))
        .collect::<Result<Vec<_>, _>>()?;
    validate_batch(&cases)?;
    Ok(cases)
}

pub fn load_batch(path: &Path) -> Result<Vec<TestCase>, CaseFileError> {
    let content = std::fs::read_to_string(path).map_err(|e| CaseFileError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_batch(&content)
}

/// Fills `{api}`, `{function}` and `{round}` in a case-file path template.
///
/// API and function names are reduced to their path-safe keys first.
pub fn resolve_case_path(template: &str, api: &str, function: &str, round: u32) -> PathBuf {
    PathBuf::from(
        template
            .replace("{api}", &crate::store::path_key(api))
            .replace("{function}", &crate::store::path_key(function))
            .replace("{round}", &round.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BATCH: &str = r#"[
        {
            "Test_Case": 1,
            "API_Name": "zdo/mgmt_bind_request",
            "Function_Name": "from_values()",
            "Description": "Empty table with zero start index.",
            "Code_Snippets": ["from_values({}, 0)"]
        },
        {
            "Test_Case": "2",
            "API_Name": "zdo/mgmt_bind_request",
            "Function_Name": "from_values()",
            "Description": "Negative start index.",
            "Code_Snippets": ["from_values({}, -1)"],
            "Pre-operation_Python": "reset_hub()"
        },
        {
            "Test_Case": 3,
            "API_Name": "zdo/mgmt_bind_request",
            "Function_Name": "from_values()",
            "Code_Snippets": ["from_values({}, 999999)"]
        }
    ]"#;

    #[test]
    fn parse_batch_keeps_array_order_and_fields() {
        let cases = parse_batch(BATCH).unwrap();
        assert_eq!(cases.len(), 3);
        assert_eq!(
            cases.iter().map(|c| c.number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(cases[1].pre_operation.as_deref(), Some("reset_hub()"));
        assert_eq!(cases[2].description, "");
        assert_eq!(cases[2].snippets, vec!["from_values({}, 999999)"]);
    }

    #[test]
    fn parse_batch_rejects_records_without_snippets() {
        let json = r#"[{"Test_Case": 1, "API_Name": "buf/Buf", "Function_Name": "seek()", "Code_Snippets": []}]"#;
        match parse_batch(json) {
            Err(CaseFileError::InvalidRecord { index, reason }) => {
                assert_eq!(index, 0);
                assert!(reason.contains("Code_Snippets"));
            }
            other => panic!("Expected InvalidRecord, got {other:?}"),
        }
    }

    #[test]
    fn parse_batch_rejects_missing_api_name() {
        let json = r#"[{"Test_Case": 1, "Function_Name": "seek()", "Code_Snippets": ["seek(0)"]}]"#;
        assert!(matches!(
            parse_batch(json),
            Err(CaseFileError::InvalidRecord { index: 0, .. })
        ));
    }

    #[test]
    fn parse_batch_rejects_out_of_order_numbers() {
        let json = r#"[
            {"Test_Case": 2, "API_Name": "a", "Function_Name": "f()", "Code_Snippets": ["f(1)"]},
            {"Test_Case": 1, "API_Name": "a", "Function_Name": "f()", "Code_Snippets": ["f(2)"]}
        ]"#;
        assert!(matches!(
            parse_batch(json),
            Err(CaseFileError::InvalidRecord { index: 1, .. })
        ));
    }

    #[test]
    fn parse_batch_rejects_empty_and_non_array_input() {
        assert!(matches!(parse_batch("[]"), Err(CaseFileError::Empty)));
        assert!(matches!(
            parse_batch(r#"{"Test_Case": 1}"#),
            Err(CaseFileError::Malformed(_))
        ));
    }

    #[test]
    fn request_line_is_one_json_object_with_newline() {
        let cases = parse_batch(BATCH).unwrap();
        let line = cases[0].to_request_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["Test_Case"], 1);
        assert_eq!(value["Code_Snippets"][0], "from_values({}, 0)");
        assert!(value.get("Pre-operation_Python").is_none());
    }

    #[test]
    fn load_batch_reports_missing_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load_batch(&missing),
            Err(CaseFileError::Io { .. })
        ));
        let present = dir.path().join("cases.json");
        std::fs::write(&present, BATCH).unwrap();
        assert_eq!(load_batch(&present).unwrap().len(), 3);
    }

    #[test]
    fn case_path_template_uses_path_keys() {
        let path = resolve_case_path(
            "cases/{api}-{round}{function}.json",
            "zdo/mgmt_bind_request",
            "from_values()",
            2,
        );
        assert_eq!(
            path,
            PathBuf::from("cases/zdo-mgmt_bind_request-2from_values.json")
        );
    }
}
