//! Sheet agent: decodes a base64 spreadsheet and returns the requested
//! input/output columns as `{column: [values...]}` tables.
//!
//! Only CSV is understood. Requested columns the sheet does not have are
//! skipped; cells that parse as numbers are emitted as JSON numbers.

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{Map, Number, Value};

use super::Transform;
use crate::error::TransformError;
use crate::message::Payload;
use crate::schema::{ColumnTable, SheetRequest, SheetResponse};

pub struct SheetTransform;

#[async_trait]
impl Transform for SheetTransform {
    fn name(&self) -> &str {
        "sheet"
    }

    async fn apply(&self, payload: Payload) -> Result<Value, TransformError> {
        let Payload::Json(map) = payload else {
            return Err(TransformError::invalid("sheet expects a JSON payload"));
        };
        let request: SheetRequest = serde_json::from_value(Value::Object(map))?;
        let response = select(&request)?;
        serde_json::to_value(response).map_err(|e| TransformError::failed(e.to_string()))
    }
}

fn select(request: &SheetRequest) -> Result<SheetResponse, TransformError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(request.sheet_data.trim())
        .map_err(|e| TransformError::invalid(format!("sheet_data is not base64: {}", e)))?;

    let name = request.sheet_name.to_ascii_lowercase();
    if name.ends_with(".xlsx") || name.ends_with(".xls") {
        return Err(TransformError::failed(format!(
            "unsupported sheet format '{}': only .csv is supported",
            request.sheet_name
        )));
    }
    if !name.ends_with(".csv") {
        return Err(TransformError::failed(format!(
            "unsupported sheet format '{}'",
            request.sheet_name
        )));
    }

    let content = String::from_utf8(bytes)
        .map_err(|e| TransformError::failed(format!("sheet is not UTF-8: {}", e)))?;
    let table = parse_csv(&content);

    tracing::debug!(
        "[Worker:sheet] '{}': {} column(s), {} row(s)",
        request.sheet_name,
        table.headers.len(),
        table.rows.len()
    );

    Ok(SheetResponse {
        input: table.columns(&request.input_columns),
        output: table.columns(&request.output_columns),
    })
}

struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn columns(&self, wanted: &[String]) -> ColumnTable {
        let mut out = Map::new();
        for name in wanted {
            let Some(idx) = self.headers.iter().position(|h| h == name) else {
                tracing::debug!("[Worker:sheet] Skipping unknown column '{}'", name);
                continue;
            };
            let values = self
                .rows
                .iter()
                .map(|row| cell_value(row.get(idx).map(String::as_str).unwrap_or("")))
                .collect();
            out.insert(name.clone(), Value::Array(values));
        }
        out
    }
}

fn cell_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Some(n) = cell.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(cell.to_string())
}

fn parse_csv(content: &str) -> Table {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let headers = lines.next().map(split_record).unwrap_or_default();
    let rows = lines.map(split_record).collect();
    Table { headers, rows }
}

/// Split one record on commas, honouring double-quoted fields with `""`
/// escapes. Quoted fields spanning lines are not supported.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn test_split_record_quotes() {
        assert_eq!(
            split_record(r#"a, "b, c" ,"say ""hi""""#),
            vec!["a", "b, c", r#"say "hi""#]
        );
    }

    #[tokio::test]
    async fn test_selects_columns_and_skips_unknown() {
        let csv = "x,y,z,label\n1,2.5,3,a\n4,5,6,b\n";
        let map = json!({
            "input_columns": ["x", "y", "missing"],
            "output_columns": ["z"],
            "sheet_data": encode(csv),
            "sheet_name": "data.csv"
        });
        let reply = SheetTransform
            .apply(Payload::Json(map.as_object().cloned().unwrap()))
            .await
            .unwrap();
        assert_eq!(reply["input"]["x"], json!([1, 4]));
        assert_eq!(reply["input"]["y"], json!([2.5, 5]));
        assert!(reply["input"].get("missing").is_none());
        assert_eq!(reply["output"], json!({"z": [3, 6]}));
    }

    #[tokio::test]
    async fn test_xlsx_is_a_domain_failure() {
        let map = json!({"sheet_data": encode("PK"), "sheet_name": "book.xlsx"});
        let err = SheetTransform
            .apply(Payload::Json(map.as_object().cloned().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Failed(_)));
    }

    #[tokio::test]
    async fn test_bad_base64_is_invalid_input() {
        let map = json!({"sheet_data": "***", "sheet_name": "a.csv"});
        let err = SheetTransform
            .apply(Payload::Json(map.as_object().cloned().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidInput(_)));
    }
}
