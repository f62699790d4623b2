use serde_json::Value;

/// Persisted status labels. The narrow summary table uses Pendiente for
/// blank cells; the detailed table historically used Cursando.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estado {
    Aprobado,
    Reprobado,
    Pendiente,
    Cursando,
    NoEntrego,
}

impl Estado {
    pub fn as_str(self) -> &'static str {
        match self {
            Estado::Aprobado => "Aprobado",
            Estado::Reprobado => "Reprobado",
            Estado::Pendiente => "Pendiente",
            Estado::Cursando => "Cursando",
            Estado::NoEntrego => "No entregó",
        }
    }
}

/// Deployment-configurable letter mapping (setup section "grading").
#[derive(Debug, Clone, Copy)]
pub struct GradePolicy {
    pub nota_a: f64,
    pub nota_f: f64,
    pub nota_min_aprobacion: f64,
}

impl Default for GradePolicy {
    fn default() -> Self {
        GradePolicy {
            nota_a: 5.0,
            nota_f: 2.0,
            nota_min_aprobacion: 3.0,
        }
    }
}

impl GradePolicy {
    pub fn from_section(section: &Value) -> Self {
        let d = GradePolicy::default();
        GradePolicy {
            nota_a: section
                .get("notaA")
                .and_then(|v| v.as_f64())
                .unwrap_or(d.nota_a),
            nota_f: section
                .get("notaF")
                .and_then(|v| v.as_f64())
                .unwrap_or(d.nota_f),
            nota_min_aprobacion: section
                .get("notaMinAprobacion")
                .and_then(|v| v.as_f64())
                .unwrap_or(d.nota_min_aprobacion),
        }
    }
}

/// Outcome of normalizing one raw grade token.
///
/// `estado: None` means the token carried no status of its own (blank or
/// unrecognized) and the caller's fallback applies. `reconocido: false` only
/// for non-blank tokens outside the letter set that also fail numeric parse;
/// those persist as pending and surface as a soft warning, never a hard
/// reject.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedGrade {
    pub nota: Option<f64>,
    pub letra: Option<&'static str>,
    pub estado: Option<Estado>,
    pub reconocido: bool,
}

/// Canonicalize a raw grade token: letters A/F/D/'-', blank, or a bare
/// number. Numeric range checking is the validator's job; this function
/// passes any parsed number through and derives its status by threshold.
pub fn normalize(raw: &str, policy: &GradePolicy) -> NormalizedGrade {
    let token = raw.trim().to_uppercase();
    match token.as_str() {
        "" => NormalizedGrade {
            nota: None,
            letra: None,
            estado: None,
            reconocido: true,
        },
        "A" => NormalizedGrade {
            nota: Some(policy.nota_a),
            letra: Some("A"),
            estado: Some(Estado::Aprobado),
            reconocido: true,
        },
        "F" => NormalizedGrade {
            nota: Some(policy.nota_f),
            letra: Some("F"),
            estado: Some(Estado::Reprobado),
            reconocido: true,
        },
        "D" => NormalizedGrade {
            nota: Some(policy.nota_f),
            letra: Some("D"),
            estado: Some(Estado::Reprobado),
            reconocido: true,
        },
        "-" => NormalizedGrade {
            nota: None,
            letra: Some("-"),
            estado: Some(Estado::NoEntrego),
            reconocido: true,
        },
        _ => match parse_nota(&token) {
            Some(v) => NormalizedGrade {
                nota: Some(v),
                letra: None,
                estado: Some(if v >= policy.nota_min_aprobacion {
                    Estado::Aprobado
                } else {
                    Estado::Reprobado
                }),
                reconocido: true,
            },
            None => NormalizedGrade {
                nota: None,
                letra: None,
                estado: None,
                reconocido: false,
            },
        },
    }
}

/// Spreadsheets from es-CO locales carry comma decimals.
pub fn parse_nota(raw: &str) -> Option<f64> {
    raw.trim().replace(',', ".").parse::<f64>().ok()
}

/// Free-text synonyms accepted by the single-column upload. Returns the
/// canonical token, or None for values outside the synonym table (the caller
/// records those as Pendiente plus a warning).
pub fn fold_valor(raw: &str) -> Option<&'static str> {
    let v = raw.trim().to_uppercase();
    match v.as_str() {
        "" => Some(""),
        "A" => Some("A"),
        "D" => Some("D"),
        "-" => Some("-"),
        "APROBADO" | "A PROBADO" => Some("A"),
        "REPROBADO" | "REPROBADA" => Some("D"),
        "NO ENTREGÓ" | "NO ENTREGO" | "NO ENTREGADO" | "NO ENTREGADA" => Some("-"),
        _ => None,
    }
}

/// Letter-to-score schemes used by read-side aggregation (not by ingestion,
/// which goes through `normalize` and the grading policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Historical dashboard heuristic: A=9.0, D/F=6.0.
    Heuristic,
    /// Bulk-upload numeric scale: A=5.0, D/F=2.0.
    Nota,
}

pub fn letter_to_score(letra: Option<&str>, scheme: Scheme) -> f64 {
    let Some(l) = letra else {
        return 0.0;
    };
    match (l.trim().to_uppercase().as_str(), scheme) {
        ("A", Scheme::Heuristic) => 9.0,
        ("D" | "F", Scheme::Heuristic) => 6.0,
        ("A", Scheme::Nota) => 5.0,
        ("D" | "F", Scheme::Nota) => 2.0,
        _ => 0.0,
    }
}

pub fn average_letters<'a, I>(letras: I, scheme: Scheme) -> f64
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let scores: Vec<f64> = letras
        .into_iter()
        .filter(|l| l.map(|s| !s.trim().is_empty()).unwrap_or(false))
        .map(|l| letter_to_score(l, scheme))
        .collect();
    if scores.is_empty() {
        return 0.0;
    }
    let avg = scores.iter().sum::<f64>() / scores.len() as f64;
    (avg * 100.0).round() / 100.0
}
