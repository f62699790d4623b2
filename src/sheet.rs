use serde_json::Value;

/// Parsed tabular payload: a header row plus data rows of JSON scalars.
/// The host parses spreadsheet files and ships them here as
/// `{ "columns": [..], "rows": [[..], ..] }`; this process never touches
/// xlsx bytes.
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn from_params(v: &Value) -> Result<Table, String> {
        let Some(obj) = v.as_object() else {
            return Err("table must be an object with columns and rows".to_string());
        };
        let Some(cols) = obj.get("columns").and_then(|c| c.as_array()) else {
            return Err("table.columns must be an array".to_string());
        };
        let mut columns = Vec::with_capacity(cols.len());
        for c in cols {
            let Some(s) = c.as_str() else {
                return Err("table.columns entries must be strings".to_string());
            };
            columns.push(s.to_string());
        }
        if columns.is_empty() {
            return Err("table.columns must not be empty".to_string());
        }
        let Some(rows_arr) = obj.get("rows").and_then(|r| r.as_array()) else {
            return Err("table.rows must be an array".to_string());
        };
        let mut rows = Vec::with_capacity(rows_arr.len());
        for (i, r) in rows_arr.iter().enumerate() {
            let Some(cells) = r.as_array() else {
                return Err(format!("table.rows[{}] must be an array", i));
            };
            rows.push(cells.clone());
        }
        Ok(Table { columns, rows })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell as trimmed text; null and out-of-range cells read as "".
    pub fn cell(&self, row: usize, col: usize) -> String {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(cell_str)
            .unwrap_or_default()
    }
}

/// Spreadsheet parsers type cells however they like; everything downstream
/// works on trimmed text. Integral floats print without the trailing ".0"
/// so numeric document/id cells match their text form.
pub fn cell_str(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(f) = n.as_f64() {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
                    format!("{}", f as i64)
                } else {
                    format!("{}", f)
                }
            } else {
                n.to_string()
            }
        }
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Canonical header form: trimmed, lowercased, accented vowels folded,
/// double spaces collapsed.
pub fn normalize_header(h: &str) -> String {
    let mut s = h.trim().to_lowercase();
    for (from, to) in [("á", "a"), ("é", "e"), ("í", "i"), ("ó", "o"), ("ú", "u")] {
        s = s.replace(from, to);
    }
    s.replace("  ", " ")
}
