use crate::sheet::Table;
use rusqlite::Connection;
use std::collections::HashMap;

/// Batch-local lookup maps, built once per request in two queries. Keys are
/// trimmed + lowercased so free-text code cells match regardless of case.
pub struct RefMaps {
    pub materias: HashMap<String, i64>,
    pub fichas: HashMap<String, i64>,
}

pub fn prefetch_ref_maps(conn: &Connection) -> anyhow::Result<RefMaps> {
    let mut materias = HashMap::new();
    let mut stmt = conn.prepare("SELECT id, codigo FROM materias")?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?))
    })?;
    for row in rows {
        let (id, codigo) = row?;
        if let Some(c) = codigo {
            let key = c.trim().to_lowercase();
            if !key.is_empty() {
                materias.insert(key, id);
            }
        }
    }

    let mut fichas = HashMap::new();
    let mut stmt = conn.prepare("SELECT id, numero FROM fichas")?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?))
    })?;
    for row in rows {
        let (id, numero) = row?;
        if let Some(n) = numero {
            let key = n.trim().to_lowercase();
            if !key.is_empty() {
                fichas.insert(key, id);
            }
        }
    }

    Ok(RefMaps { materias, fichas })
}

/// A non-empty id cell is trusted: it must parse to a positive integer or the
/// row is unresolved (no fallback to the code cell). An empty id cell defers
/// to the code cell, looked up case-insensitively.
pub fn resolve_ref(id_cell: &str, code_cell: &str, map: &HashMap<String, i64>) -> Option<i64> {
    if !id_cell.is_empty() {
        return match parse_id(id_cell) {
            Some(id) if id > 0 => Some(id),
            _ => None,
        };
    }
    let key = code_cell.trim().to_lowercase();
    if key.is_empty() {
        return None;
    }
    map.get(&key).copied()
}

fn parse_id(s: &str) -> Option<i64> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(i);
    }
    // xlsx numeric cells may arrive as "12.0"
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => Some(f as i64),
        _ => None,
    }
}

const DOCUMENTO_VARIANTS: &[&str] = &[
    "documento",
    "numero de cedula",
    "numero_cedula",
    "numero cedula",
    "cedula",
    "nro documento",
];
const NOMBRE_VARIANTS: &[&str] = &[
    "apellidos y nombres",
    "apellidos_y_nombres",
    "nombres y apellidos",
    "nombres_apellidos",
    "nombre",
    "nombres",
    "nombres completos",
    "apellidos nombres",
];
const APELLIDO_VARIANTS: &[&str] = &["apellido", "apellidos", "apellido(s)", "apellidos(s)", "apell"];
const CORREO_VARIANTS: &[&str] = &[
    "correo electronico",
    "correo_electronico",
    "email",
    "correo",
    "email institucional",
    "correo institucional",
];

/// Column indices the wide layout's identity fields resolved to. `None` means
/// no plausible column was found for that field.
#[derive(Debug, Default, PartialEq)]
pub struct IdentityColumns {
    pub documento: Option<usize>,
    pub nombre: Option<usize>,
    pub apellido: Option<usize>,
    pub correo: Option<usize>,
}

/// Maps normalized headers to identity fields: exact synonym match first,
/// substring heuristic second, and a final guard that drops any mapped column
/// whose data is mostly grade letters (a mislabeled evidence column).
/// Evidence columns themselves (headers containing "(letra)") are never
/// candidates.
pub fn map_identity_columns(table: &Table, normalized: &[String]) -> IdentityColumns {
    let candidates: Vec<usize> = normalized
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.contains("(letra)"))
        .map(|(i, _)| i)
        .collect();

    let pick = |variants: &[&str], subs: &[&str]| -> Option<usize> {
        for &i in &candidates {
            if variants.contains(&normalized[i].as_str()) {
                return Some(i);
            }
        }
        for &i in &candidates {
            for sub in subs {
                if normalized[i].contains(sub) {
                    return Some(i);
                }
            }
        }
        None
    };

    let mut mapped = IdentityColumns {
        documento: pick(DOCUMENTO_VARIANTS, &["documento", "cedula"]),
        nombre: pick(NOMBRE_VARIANTS, &["nombre", "apell"]),
        apellido: pick(APELLIDO_VARIANTS, &["apell"]),
        correo: pick(CORREO_VARIANTS, &["correo", "email"]),
    };

    for slot in [
        &mut mapped.documento,
        &mut mapped.nombre,
        &mut mapped.apellido,
        &mut mapped.correo,
    ] {
        if let Some(i) = *slot {
            if mostly_letters(table, i) {
                *slot = None;
            }
        }
    }

    mapped
}

/// More than 80% of the column's non-empty cells are A/D/-.
pub fn mostly_letters(table: &Table, col: usize) -> bool {
    let mut non_empty = 0usize;
    let mut letter_like = 0usize;
    for row in 0..table.rows.len() {
        let v = table.cell(row, col).to_uppercase();
        if v.is_empty() {
            continue;
        }
        non_empty += 1;
        if matches!(v.as_str(), "A" | "D" | "-") {
            letter_like += 1;
        }
    }
    non_empty > 0 && (letter_like as f64) / (non_empty as f64) > 0.8
}

/// Evidence columns carry a "(letra)" marker in the normalized header; the
/// stored evidence name is the header with the marker removed.
pub fn evidencia_columns(normalized: &[String]) -> Vec<(usize, String)> {
    normalized
        .iter()
        .enumerate()
        .filter(|(_, c)| c.contains("(letra)"))
        .map(|(i, c)| {
            let name = c.replace("(letra)", "").trim().replace("  ", " ");
            (i, name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(columns: &[&str], rows: serde_json::Value) -> Table {
        Table::from_params(&json!({ "columns": columns, "rows": rows })).unwrap()
    }

    fn normalized(t: &Table) -> Vec<String> {
        t.columns
            .iter()
            .map(|c| crate::sheet::normalize_header(c))
            .collect()
    }

    #[test]
    fn trusted_id_beats_code_lookup() {
        let mut map = HashMap::new();
        map.insert("mat-101".to_string(), 7);
        assert_eq!(resolve_ref("12", "", &map), Some(12));
        assert_eq!(resolve_ref("12.0", "", &map), Some(12));
        assert_eq!(resolve_ref("", "  MAT-101 ", &map), Some(7));
        assert_eq!(resolve_ref("", "unknown", &map), None);
        // present but non-positive / unparsable id cells do not fall back
        assert_eq!(resolve_ref("0", "mat-101", &map), None);
        assert_eq!(resolve_ref("abc", "mat-101", &map), None);
    }

    #[test]
    fn exact_variants_win_over_substrings() {
        let t = table(
            &["Correo Electrónico", "Nombres y Apellidos", "Evidencia 1 (Letra)"],
            json!([["ana@x.edu", "Ana Pérez", "A"]]),
        );
        let n = normalized(&t);
        let m = map_identity_columns(&t, &n);
        assert_eq!(m.correo, Some(0));
        assert_eq!(m.nombre, Some(1));
        assert_eq!(m.documento, None);
        // the combined name column also satisfies the apellido substring
        assert_eq!(m.apellido, Some(1));
    }

    #[test]
    fn substring_heuristic_catches_odd_headers() {
        let t = table(
            &["Email del aprendiz", "Nombre completo del aprendiz", "Taller (Letra)"],
            json!([["b@x.edu", "Beto Ruiz", "D"]]),
        );
        let n = normalized(&t);
        let m = map_identity_columns(&t, &n);
        assert_eq!(m.correo, Some(0));
        assert_eq!(m.nombre, Some(1));
    }

    #[test]
    fn letter_heavy_columns_are_rejected_as_identity() {
        // A column literally named "documento" but holding grade letters is a
        // mislabeled evidence column, not an identity column.
        let t = table(
            &["documento", "correo", "nombre"],
            json!([
                ["A", "a@x.edu", "Ana"],
                ["D", "b@x.edu", "Beto"],
                ["-", "c@x.edu", "Cai"],
                ["A", "d@x.edu", "Dora"],
                ["A", "e@x.edu", "Eli"]
            ]),
        );
        let n = normalized(&t);
        let m = map_identity_columns(&t, &n);
        assert_eq!(m.documento, None);
        assert_eq!(m.correo, Some(1));
        assert_eq!(m.nombre, Some(2));
    }

    #[test]
    fn evidence_columns_strip_their_marker() {
        let cols = vec![
            "correo".to_string(),
            "evidencia 1 (letra)".to_string(),
            "taller final  (letra)".to_string(),
        ];
        let evs = evidencia_columns(&cols);
        assert_eq!(evs.len(), 2);
        assert_eq!(evs[0], (1, "evidencia 1".to_string()));
        assert_eq!(evs[1], (2, "taller final".to_string()));
    }

    #[test]
    fn mostly_letters_needs_a_real_majority() {
        let t = table(
            &["col"],
            json!([["A"], ["D"], ["hola"], ["-"], [""]]),
        );
        // 3 of 4 non-empty cells = 75%, below the bar
        assert!(!mostly_letters(&t, 0));
        let t = table(&["col"], json!([["A"], ["D"], ["-"], ["A"], ["A"]]));
        assert!(mostly_letters(&t, 0));
        let t = table(&["col"], json!([[""], [null]]));
        assert!(!mostly_letters(&t, 0));
    }
}
