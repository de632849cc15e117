//! Lecteur de tables texte (CSV virgule ou point-virgule)
//!
//! Utilisé pour la table CN et pour la table de résultats du modèle hydrologique.
//! Encodage: UTF-8 (BOM accepté), repli Windows-1250 pour les fichiers tchèques
//! exportés depuis Excel.

use std::path::Path;

use memchr::{memchr, memchr_iter};
use tracing::debug;

use crate::CnError;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Table brute: en-tête optionnel et lignes de cellules
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub header: Option<Vec<String>>,
    pub rows: Vec<Vec<String>>,
    pub delimiter: u8,
}

impl Table {
    /// Index d'une colonne de l'en-tête (comparaison exacte après trim)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header
            .as_ref()?
            .iter()
            .position(|h| h.trim() == name)
    }

    /// Nombre flottant d'une cellule; la virgule décimale est acceptée pour les tables `;`
    pub fn number(&self, row: usize, col: usize) -> Option<f64> {
        let cell = self.rows.get(row)?.get(col)?;
        parse_number(cell, self.delimiter)
    }
}

/// Lit et décode un fichier tabulaire
pub fn read_table(path: &Path) -> Result<Table, CnError> {
    let bytes = std::fs::read(path)?;
    let text = decode(&bytes);
    let table = parse_table(&text);
    debug!(
        file = %path.display(),
        rows = table.rows.len(),
        delimiter = %(table.delimiter as char),
        "Table loaded"
    );
    Ok(table)
}

/// Décode des octets en texte: UTF-8 sans BOM, sinon Windows-1250
pub fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match simdutf8::basic::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1250.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Découpe le texte en cellules. Le délimiteur est déduit de la première ligne
/// non vide. La première ligne est stockée comme en-tête si aucune de ses
/// cellules n'est numérique; l'appelant peut en décider autrement via
/// [`Table::with_header`].
pub fn parse_table(text: &str) -> Table {
    let lines: Vec<&str> = split_lines(text)
        .into_iter()
        .filter(|l| !l.trim().is_empty())
        .collect();

    let delimiter = lines.first().map(|l| detect_delimiter(l)).unwrap_or(b',');
    let mut rows: Vec<Vec<String>> = lines.iter().map(|l| split_cells(l, delimiter)).collect();

    let header = match rows.first() {
        Some(first) if first.iter().all(|c| parse_number(c, delimiter).is_none()) => {
            Some(rows.remove(0))
        }
        _ => None,
    };

    Table {
        header,
        rows,
        delimiter,
    }
}

impl Table {
    /// Force la présence ou l'absence d'en-tête
    pub fn with_header(mut self, has_header: bool) -> Self {
        match (has_header, self.header.take()) {
            (true, Some(h)) => self.header = Some(h),
            (true, None) => {
                if !self.rows.is_empty() {
                    self.header = Some(self.rows.remove(0));
                }
            }
            (false, Some(h)) => self.rows.insert(0, h),
            (false, None) => {}
        }
        self
    }
}

fn split_lines(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    for pos in memchr_iter(b'\n', bytes) {
        lines.push(text[start..pos].trim_end_matches('\r'));
        start = pos + 1;
    }
    if start < bytes.len() {
        lines.push(text[start..].trim_end_matches('\r'));
    }
    lines
}

fn detect_delimiter(line: &str) -> u8 {
    let bytes = line.as_bytes();
    let semicolons = memchr_iter(b';', bytes).count();
    let commas = memchr_iter(b',', bytes).count();
    if semicolons > 0 && semicolons >= commas {
        b';'
    } else {
        b','
    }
}

/// Découpe une ligne en respectant les guillemets doubles (`""` = guillemet échappé)
fn split_cells(line: &str, delimiter: u8) -> Vec<String> {
    if memchr(b'"', line.as_bytes()).is_none() {
        return line
            .split(delimiter as char)
            .map(|c| c.trim().to_string())
            .collect();
    }

    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if !in_quotes && c == delimiter as char => {
                cells.push(current.trim().to_string());
                current.clear();
            }
            c => current.push(c),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

/// Parse un nombre; pour une table `;` la virgule décimale est acceptée
pub fn parse_number(cell: &str, delimiter: u8) -> Option<f64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = match fast_float::parse::<f64, _>(trimmed) {
        Ok(v) => Some(v),
        Err(_) if delimiter == b';' && trimmed.contains(',') => {
            fast_float::parse::<f64, _>(trimmed.replace(',', ".")).ok()
        }
        Err(_) => None,
    };
    parsed.filter(|v| v.is_finite())
}
