//! CDL (network Common Data form Language) parsing.
//!
//! CDL is the text form `ncdump` prints and `ncgen` reads. The parser covers
//! the classic-model subset: dimensions, numeric variables with attributes,
//! global attributes and the data section. `char` and `string` variables are
//! recognised but never decoded.
//!
//! ```text
//! netcdf snapshot {
//! dimensions:
//!     lat = 2 ;
//!     lon = 2 ;
//! variables:
//!     float pm25(lat, lon) ;
//!         pm25:_FillValue = -999.f ;
//! data:
//!  pm25 = 1, 2, _, 4 ;
//! }
//! ```

use std::collections::BTreeMap;

use crate::dataset::{DatasetReader, Variable};
use crate::error::{NetCdfError, NetCdfResult};

/// An attribute value as written in CDL.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Numbers(Vec<f64>),
}

impl AttributeValue {
    /// First numeric element, if this is a numeric attribute.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Numbers(v) => v.first().copied(),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Numbers(_) => None,
        }
    }
}

/// A variable declaration from the `variables:` section.
#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub name: String,
    pub data_type: String,
    pub dimensions: Vec<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl VariableDecl {
    /// Whether values of this variable are numbers.
    pub fn is_numeric(&self) -> bool {
        !matches!(self.data_type.as_str(), "char" | "string")
    }
}

/// A parsed CDL document.
#[derive(Debug, Clone, Default)]
pub struct CdlDocument {
    pub name: String,
    pub dimensions: Vec<(String, usize)>,
    pub variables: Vec<VariableDecl>,
    pub global_attributes: BTreeMap<String, AttributeValue>,
    /// Raw values per variable; `None` marks a `_` fill placeholder.
    data: BTreeMap<String, Vec<Option<f64>>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Dimensions,
    Variables,
    Data,
}

impl CdlDocument {
    pub fn dimension_size(&self, name: &str) -> Option<usize> {
        self.dimensions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, size)| *size)
    }

    pub fn declaration(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Names of the numeric variables, in declaration order.
    pub fn numeric_variable_names(&self) -> Vec<String> {
        self.variables
            .iter()
            .filter(|v| v.is_numeric())
            .map(|v| v.name.clone())
            .collect()
    }

    /// Whether the data section carried values for `name`.
    pub fn has_data(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    /// Decode a numeric variable, applying fill, missing and packing rules.
    pub fn decode_variable(&self, name: &str) -> NetCdfResult<Variable> {
        let decl = self
            .declaration(name)
            .ok_or_else(|| NetCdfError::MissingData(format!("{} variable", name)))?;

        if !decl.is_numeric() {
            return Err(NetCdfError::InvalidFormat(format!(
                "{} is a {} variable",
                name, decl.data_type
            )));
        }

        let raw = self
            .data
            .get(name)
            .ok_or_else(|| NetCdfError::MissingData(format!("data for {}", name)))?;

        let mut shape = Vec::with_capacity(decl.dimensions.len());
        for dim in &decl.dimensions {
            let size = self.dimension_size(dim).ok_or_else(|| {
                NetCdfError::InvalidFormat(format!("{} uses undeclared dimension {}", name, dim))
            })?;
            shape.push(size);
        }

        let expected: usize = shape.iter().product();
        // Unlimited dimensions report their size only in a comment, so trust
        // the data length when it disagrees with a zero-length record axis.
        if raw.len() != expected {
            if expected == 0 && !shape.is_empty() {
                let fixed: usize = shape.iter().skip(1).product();
                if fixed > 0 && raw.len() % fixed == 0 {
                    shape[0] = raw.len() / fixed;
                } else {
                    return Err(length_mismatch(name, expected, raw.len()));
                }
            } else {
                return Err(length_mismatch(name, expected, raw.len()));
            }
        }

        let fill = decl.attributes.get("_FillValue").and_then(|a| a.as_f64());
        let missing: Vec<f64> = match decl.attributes.get("missing_value") {
            Some(AttributeValue::Numbers(v)) => v.clone(),
            _ => Vec::new(),
        };
        let scale = decl
            .attributes
            .get("scale_factor")
            .and_then(|a| a.as_f64())
            .unwrap_or(1.0);
        let offset = decl
            .attributes
            .get("add_offset")
            .and_then(|a| a.as_f64())
            .unwrap_or(0.0);

        let values = raw
            .iter()
            .map(|v| match v {
                None => f64::NAN,
                Some(x) if fill.is_some_and(|f| same_value(*x, f)) => f64::NAN,
                Some(x) if missing.iter().any(|m| same_value(*x, *m)) => f64::NAN,
                Some(x) => x * scale + offset,
            })
            .collect();

        Ok(Variable::new(name, shape, values))
    }
}

fn length_mismatch(name: &str, expected: usize, actual: usize) -> NetCdfError {
    NetCdfError::InvalidFormat(format!(
        "{} has {} values, dimensions require {}",
        name, actual, expected
    ))
}

/// Fill comparisons tolerate the float32 rounding CDL text goes through.
fn same_value(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs());
    scale > 0.0 && ((a - b).abs() / scale) < 1e-6
}

/// A fully parsed CDL document exposed as a dataset.
#[derive(Debug, Clone)]
pub struct CdlDataset {
    document: CdlDocument,
}

impl CdlDataset {
    pub fn new(document: CdlDocument) -> Self {
        Self { document }
    }

    pub fn document(&self) -> &CdlDocument {
        &self.document
    }
}

impl DatasetReader for CdlDataset {
    fn variable_names(&self) -> Vec<String> {
        self.document
            .numeric_variable_names()
            .into_iter()
            .filter(|n| self.document.has_data(n))
            .collect()
    }

    fn read_variable(&self, name: &str) -> NetCdfResult<Variable> {
        self.document.decode_variable(name)
    }

    fn is_materialized(&self) -> bool {
        true
    }
}

/// Whether `text` looks like a CDL document.
pub fn looks_like_cdl(text: &str) -> bool {
    text.trim_start().starts_with("netcdf")
}

/// Parse a CDL document. A missing `data:` section (as in `ncdump -h`
/// output) is accepted.
pub fn parse(text: &str) -> NetCdfResult<CdlDocument> {
    if !looks_like_cdl(text) {
        return Err(NetCdfError::InvalidFormat(
            "CDL text must start with 'netcdf'".to_string(),
        ));
    }

    let mut doc = CdlDocument::default();
    let mut section = Section::Preamble;
    let mut variables_text = String::new();
    let mut data_text = String::new();

    for raw_line in text.lines() {
        let trimmed = raw_line.trim();

        if section == Section::Preamble {
            if let Some(rest) = trimmed.strip_prefix("netcdf") {
                doc.name = rest.trim().trim_end_matches('{').trim().to_string();
                section = Section::Dimensions;
                continue;
            }
        }

        match trimmed {
            "dimensions:" => {
                section = Section::Dimensions;
                continue;
            }
            "variables:" => {
                section = Section::Variables;
                continue;
            }
            "data:" => {
                section = Section::Data;
                continue;
            }
            "}" => break,
            _ => {}
        }

        match section {
            Section::Preamble => {}
            Section::Dimensions => parse_dimension_line(raw_line, &mut doc.dimensions)?,
            Section::Variables => {
                variables_text.push_str(strip_comment(raw_line));
                variables_text.push('\n');
            }
            Section::Data => {
                data_text.push_str(strip_comment(raw_line));
                data_text.push('\n');
            }
        }
    }

    for statement in split_statements(&variables_text) {
        parse_variables_statement(&statement, &mut doc)?;
    }

    for statement in split_statements(&data_text) {
        parse_data_statement(&statement, &mut doc)?;
    }

    Ok(doc)
}

/// Parse `lat = 2 ;` or `time = UNLIMITED ; // (24 currently)`.
fn parse_dimension_line(line: &str, dims: &mut Vec<(String, usize)>) -> NetCdfResult<()> {
    let currently = line
        .find("//")
        .and_then(|idx| {
            let comment = &line[idx + 2..];
            let open = comment.find('(')?;
            let close = comment.find("currently")?;
            comment[open + 1..close].trim().parse::<usize>().ok()
        });

    let body = strip_comment(line);
    for assignment in body.split([';', ',']) {
        let assignment = assignment.trim();
        if assignment.is_empty() {
            continue;
        }
        let (name, size) = assignment.split_once('=').ok_or_else(|| {
            NetCdfError::InvalidFormat(format!("bad dimension declaration: {}", assignment))
        })?;
        let size = size.trim();
        let size = if size.eq_ignore_ascii_case("UNLIMITED") {
            currently.unwrap_or(0)
        } else {
            size.parse::<usize>().map_err(|_| {
                NetCdfError::InvalidFormat(format!("bad dimension size: {}", size))
            })?
        };
        dims.push((name.trim().to_string(), size));
    }
    Ok(())
}

fn parse_variables_statement(statement: &str, doc: &mut CdlDocument) -> NetCdfResult<()> {
    if let Some((lhs, rhs)) = split_outside_quotes(statement, '=') {
        let (owner, attr) = lhs.trim().split_once(':').ok_or_else(|| {
            NetCdfError::InvalidFormat(format!("bad attribute: {}", statement))
        })?;
        let value = parse_attribute_value(rhs.trim());
        let owner = owner.trim();
        let attr = attr.trim().to_string();

        if owner.is_empty() {
            doc.global_attributes.insert(attr, value);
        } else if let Some(decl) = doc.variables.iter_mut().find(|v| v.name == owner) {
            decl.attributes.insert(attr, value);
        }
        return Ok(());
    }

    let (data_type, rest) = statement.trim().split_once(char::is_whitespace).ok_or_else(|| {
        NetCdfError::InvalidFormat(format!("bad variable declaration: {}", statement))
    })?;

    let rest = rest.trim();
    let (name, dimensions) = match rest.find('(') {
        Some(open) => {
            let close = rest.rfind(')').ok_or_else(|| {
                NetCdfError::InvalidFormat(format!("unclosed dimension list: {}", rest))
            })?;
            let dims = rest[open + 1..close]
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
            (rest[..open].trim().to_string(), dims)
        }
        None => (rest.to_string(), Vec::new()),
    };

    doc.variables.push(VariableDecl {
        name,
        data_type: data_type.to_string(),
        dimensions,
        attributes: BTreeMap::new(),
    });
    Ok(())
}

fn parse_attribute_value(value: &str) -> AttributeValue {
    if value.starts_with('"') {
        let mut text = String::new();
        let mut in_string = false;
        let mut escaped = false;
        for c in value.chars() {
            if escaped {
                text.push(c);
                escaped = false;
            } else if c == '\\' && in_string {
                escaped = true;
            } else if c == '"' {
                in_string = !in_string;
            } else if in_string {
                text.push(c);
            }
        }
        return AttributeValue::Text(text);
    }

    AttributeValue::Numbers(value.split(',').filter_map(parse_number).collect())
}

fn parse_data_statement(statement: &str, doc: &mut CdlDocument) -> NetCdfResult<()> {
    let (name, values) = split_outside_quotes(statement, '=').ok_or_else(|| {
        NetCdfError::InvalidFormat(format!("bad data statement: {}", statement))
    })?;
    let name = name.trim();

    let numeric = doc.declaration(name).map(|d| d.is_numeric()).unwrap_or(false);
    if !numeric {
        return Ok(());
    }

    let mut parsed = Vec::new();
    for token in values.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token == "_" {
            parsed.push(None);
            continue;
        }
        let value = parse_number(token).ok_or_else(|| {
            NetCdfError::InvalidFormat(format!("bad value {:?} in {}", token, name))
        })?;
        parsed.push(Some(value));
    }

    doc.data.insert(name.to_string(), parsed);
    Ok(())
}

/// Parse a CDL numeric literal, tolerating type suffixes such as `f`, `s`,
/// `b`, `L` or `UB`.
pub fn parse_number(token: &str) -> Option<f64> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    if let Ok(v) = token.parse::<f64>() {
        return Some(v);
    }

    let mut stripped = token;
    for _ in 0..3 {
        let last = stripped.chars().last()?;
        if !last.is_ascii_alphabetic() {
            break;
        }
        stripped = &stripped[..stripped.len() - 1];
        if let Ok(v) = stripped.parse::<f64>() {
            return Some(v);
        }
    }
    None
}

/// Cut a trailing `//` comment, ignoring slashes inside string literals.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    for i in 0..bytes.len() {
        let b = bytes[i];
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Split section text into `;`-terminated statements.
fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => {
                escaped = true;
                current.push(c);
            }
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            ';' if !in_string => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            '\n' | '\t' if !in_string => current.push(' '),
            _ => current.push(c),
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}

fn split_outside_quotes(text: &str, sep: char) -> Option<(&str, &str)> {
    let mut in_string = false;
    for (i, c) in text.char_indices() {
        match c {
            '"' => in_string = !in_string,
            c if c == sep && !in_string => return Some((&text[..i], &text[i + c.len_utf8()..])),
            _ => {}
        }
    }
    None
}
