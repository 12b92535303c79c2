// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use ahash::AHashMap;
use std::fmt;

/// A single row of the `* observation data` (or `* prior information`) section.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRecord {
    pub name: String,
    pub value: f64,
    pub weight: f64,
    pub group: String,
}

/// How PEST transforms a parameter during estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterTransform {
    None,
    Log,
    Fixed,
    Tied,
}

impl ParameterTransform {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "log" => Some(Self::Log),
            "fixed" => Some(Self::Fixed),
            "tied" => Some(Self::Tied),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Log => "log",
            Self::Fixed => "fixed",
            Self::Tied => "tied",
        }
    }

    /// Fixed and tied parameters are not adjusted independently.
    pub fn is_adjustable(self) -> bool {
        matches!(self, Self::None | Self::Log)
    }
}

impl fmt::Display for ParameterTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `PARCHGLIM` column: how far a parameter may move in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeLimit {
    Relative,
    Factor,
    Absolute,
}

impl ChangeLimit {
    pub fn parse(token: &str) -> Option<Self> {
        let lowered = token.to_ascii_lowercase();
        match lowered.as_str() {
            "relative" => Some(Self::Relative),
            "factor" => Some(Self::Factor),
            // PEST_HP writes the bound inline, e.g. `absolute(2)`.
            other if other.starts_with("absolute") => Some(Self::Absolute),
            _ => None,
        }
    }
}

/// A single row of the `* parameter data` section.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterRecord {
    pub name: String,
    pub transform: ParameterTransform,
    pub change_limit: ChangeLimit,
    pub value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub group: String,
    pub scale: f64,
    pub offset: f64,
    pub derivative_command: i32,
    /// Parent parameter for `tied` parameters, from the trailing `PARNME PARTIED` rows.
    pub tied_to: Option<String>,
}

/// Anything stored in a [`NamedTable`].
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for ObservationRecord {
    fn key(&self) -> &str {
        &self.name
    }
}

impl Keyed for ParameterRecord {
    fn key(&self) -> &str {
        &self.name
    }
}

/// Returned by [`NamedTable::insert`] when the key is already present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateName(pub String);

impl fmt::Display for DuplicateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "duplicate name '{}'", self.0)
    }
}

impl std::error::Error for DuplicateName {}

/// Name-keyed records that keep the order in which they were read.
#[derive(Debug, Clone)]
pub struct NamedTable<R> {
    records: Vec<R>,
    index: AHashMap<String, usize>,
}

pub type ObservationTable = NamedTable<ObservationRecord>;
pub type ParameterTable = NamedTable<ParameterRecord>;

impl<R> Default for NamedTable<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            index: AHashMap::new(),
        }
    }
}

impl<R: Keyed> NamedTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I: IntoIterator<Item = R>>(records: I) -> Result<Self, DuplicateName> {
        let mut table = Self::new();
        for record in records {
            table.insert(record)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, record: R) -> Result<(), DuplicateName> {
        let key = record.key().to_string();
        if self.index.contains_key(&key) {
            return Err(DuplicateName(key));
        }
        self.index.insert(key, self.records.len());
        self.records.push(record);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&R> {
        self.index.get(name).map(|&i| &self.records[i])
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut R> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.records[i]),
            None => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in file order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(name: &str, weight: f64, group: &str) -> ObservationRecord {
        ObservationRecord {
            name: name.to_string(),
            value: 0.0,
            weight,
            group: group.to_string(),
        }
    }

    #[test]
    fn named_table_preserves_insertion_order_and_rejects_duplicates() {
        let mut table = ObservationTable::new();
        table.insert(obs("h2", 1.0, "head")).unwrap();
        table.insert(obs("h1", 2.0, "head")).unwrap();
        assert_eq!(
            table.insert(obs("h2", 3.0, "flux")),
            Err(DuplicateName("h2".to_string()))
        );

        let names: Vec<&str> = table.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["h2", "h1"]);
        assert_eq!(table.get("h1").map(|r| r.weight), Some(2.0));
        assert_eq!(table.len(), 2);
        assert!(table.get("missing").is_none());
    }

    #[test]
    fn table_can_be_built_from_records() {
        let table = ObservationTable::from_records(vec![obs("a", 1.0, "g"), obs("b", 1.0, "g")]);
        assert_eq!(table.unwrap().len(), 2);

        let duplicated =
            ObservationTable::from_records(vec![obs("a", 1.0, "g"), obs("a", 1.0, "g")]);
        assert_eq!(duplicated.unwrap_err(), DuplicateName("a".to_string()));
    }

    #[test]
    fn transform_and_change_limit_keywords_parse_case_insensitively() {
        assert_eq!(ParameterTransform::parse("LOG"), Some(ParameterTransform::Log));
        assert_eq!(ParameterTransform::parse("tied"), Some(ParameterTransform::Tied));
        assert_eq!(ParameterTransform::parse("linear"), None);
        assert!(ParameterTransform::Log.is_adjustable());
        assert!(!ParameterTransform::Fixed.is_adjustable());

        assert_eq!(ChangeLimit::parse("Factor"), Some(ChangeLimit::Factor));
        assert_eq!(ChangeLimit::parse("absolute(2)"), Some(ChangeLimit::Absolute));
        assert_eq!(ChangeLimit::parse("sometimes"), None);
    }
}
