//! Dental tooth-cavity selection
//!
//! The dental slice stores selected teeth as comma-joined FDI codes in two
//! fields, one per dentition. The screen edits them through four group
//! selectors per dentition, so merges toggle single codes inside a group
//! instead of overwriting the whole field.

use crate::error::{SyncError, SyncResult};
use crate::record::SlicePatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TOOTH_CAVITY_PERMANENT: &str = "toothCavityPermanent";
pub const TOOTH_CAVITY_PRIMARY: &str = "toothCavityPrimary";

/// Number of anatomical groups (quadrants) per dentition
pub const GROUP_COUNT: usize = 4;

type Groups = [&'static [&'static str]; GROUP_COUNT];

const PERMANENT_GROUPS: Groups = [
    &["18", "17", "16", "15", "14", "13", "12", "11"],
    &["21", "22", "23", "24", "25", "26", "27", "28"],
    &["48", "47", "46", "45", "44", "43", "42", "41"],
    &["31", "32", "33", "34", "35", "36", "37", "38"],
];

const PRIMARY_GROUPS: Groups = [
    &["55", "54", "53", "52", "51"],
    &["61", "62", "63", "64", "65"],
    &["85", "84", "83", "82", "81"],
    &["71", "72", "73", "74", "75"],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dentition {
    Permanent,
    Primary,
}

impl Dentition {
    pub const ALL: [Dentition; 2] = [Dentition::Permanent, Dentition::Primary];

    /// Dental slice field holding this dentition's selection
    pub fn field(&self) -> &'static str {
        match self {
            Dentition::Permanent => TOOTH_CAVITY_PERMANENT,
            Dentition::Primary => TOOTH_CAVITY_PRIMARY,
        }
    }

    /// Tooth codes offered by each group selector, in display order
    pub fn groups(&self) -> &'static Groups {
        match self {
            Dentition::Permanent => &PERMANENT_GROUPS,
            Dentition::Primary => &PRIMARY_GROUPS,
        }
    }

    /// Index of the group containing `code`
    pub fn group_of(&self, code: &str) -> Option<usize> {
        self.groups()
            .iter()
            .position(|group| group.contains(&code))
    }
}

/// Ordered set of selected teeth for one dentition, kept per group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToothSelection {
    dentition: Dentition,
    groups: [Vec<String>; GROUP_COUNT],
}

impl ToothSelection {
    pub fn empty(dentition: Dentition) -> Self {
        Self {
            dentition,
            groups: Default::default(),
        }
    }

    /// Parse a comma-joined field value.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] for codes outside the dentition's
    /// enumeration and for duplicate codes.
    pub fn parse(dentition: Dentition, field: &str) -> SyncResult<Self> {
        let mut selection = Self::empty(dentition);
        for code in field.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            if selection.contains(code) {
                return Err(SyncError::InvalidPatch(format!(
                    "Duplicate tooth code {code} in {}",
                    dentition.field()
                )));
            }
            selection.insert(code)?;
        }
        Ok(selection)
    }

    /// Parse the stored value of a slice field; absent means nothing selected.
    ///
    /// # Errors
    ///
    /// Fails when the value is not a string or does not parse.
    pub fn from_value(dentition: Dentition, value: Option<&Value>) -> SyncResult<Self> {
        match value {
            None | Some(Value::Null) => Ok(Self::empty(dentition)),
            Some(Value::String(s)) => Self::parse(dentition, s),
            Some(other) => Err(SyncError::InvalidPatch(format!(
                "{} must be a string, got {other}",
                dentition.field()
            ))),
        }
    }

    pub fn dentition(&self) -> Dentition {
        self.dentition
    }

    pub fn contains(&self, code: &str) -> bool {
        self.groups.iter().any(|group| group.iter().any(|c| c == code))
    }

    /// Selected codes of one group in selection order
    pub fn group(&self, index: usize) -> &[String] {
        self.groups.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(Vec::is_empty)
    }

    /// Whether every group has at least one selected tooth
    pub fn all_groups_selected(&self) -> bool {
        self.groups.iter().all(|group| !group.is_empty())
    }

    /// Add `code` when unselected, remove it otherwise; returns the new state.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPatch`] if `code` is not a tooth of this dentition.
    pub fn toggle(&mut self, code: &str) -> SyncResult<bool> {
        let group = self.group_mut(code)?;
        if let Some(pos) = group.iter().position(|c| c == code) {
            group.remove(pos);
            Ok(false)
        } else {
            group.push(code.to_string());
            Ok(true)
        }
    }

    /// Comma-joined codes, groups in anatomical order
    pub fn to_field_string(&self) -> String {
        self.groups
            .iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn insert(&mut self, code: &str) -> SyncResult<()> {
        self.group_mut(code)?.push(code.to_string());
        Ok(())
    }

    fn group_mut(&mut self, code: &str) -> SyncResult<&mut Vec<String>> {
        let dentition = self.dentition;
        dentition
            .group_of(code)
            .and_then(|index| self.groups.get_mut(index))
            .ok_or_else(|| {
                SyncError::InvalidPatch(format!(
                    "Unknown tooth code {code} for {}",
                    dentition.field()
                ))
            })
    }
}

/// Validate tooth fields of a dental patch and rewrite them in group order.
///
/// # Errors
///
/// Fails on the first tooth field that does not parse.
pub fn normalize_patch(patch: &mut SlicePatch) -> SyncResult<()> {
    for dentition in Dentition::ALL {
        let field = dentition.field();
        if let Some(Some(value)) = patch.get(field) {
            let normalized = ToothSelection::from_value(dentition, Some(value))?.to_field_string();
            patch.insert(field, Some(Value::String(normalized)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_toggle_off_preserves_order_of_remaining() {
        let mut selection = ToothSelection::parse(Dentition::Permanent, "11,21").unwrap();
        assert!(!selection.toggle("11").unwrap());
        assert_eq!(selection.to_field_string(), "21");
    }

    #[test]
    fn test_toggle_on_does_not_disturb_other_groups() {
        let mut selection = ToothSelection::parse(Dentition::Permanent, "21,48").unwrap();
        assert!(selection.toggle("11").unwrap());
        assert_eq!(selection.to_field_string(), "11,21,48");
        assert_eq!(selection.group(1), ["21".to_string()]);
        assert_eq!(selection.group(2), ["48".to_string()]);
    }

    #[test]
    fn test_group_keeps_selection_order() {
        let mut selection = ToothSelection::empty(Dentition::Primary);
        selection.toggle("52").unwrap();
        selection.toggle("55").unwrap();
        assert_eq!(selection.to_field_string(), "52,55");
    }

    #[test]
    fn test_rejects_duplicates_and_unknown_codes() {
        assert!(ToothSelection::parse(Dentition::Permanent, "11,11").is_err());
        assert!(ToothSelection::parse(Dentition::Permanent, "19").is_err());
        // Primary codes are not valid permanent teeth
        assert!(ToothSelection::parse(Dentition::Permanent, "55").is_err());
        assert!(ToothSelection::empty(Dentition::Primary).toggle("11").is_err());
    }

    #[test]
    fn test_parse_normalizes_into_group_order() {
        let selection = ToothSelection::parse(Dentition::Permanent, " 31 ,11,").unwrap();
        assert_eq!(selection.to_field_string(), "11,31");
        assert!(ToothSelection::parse(Dentition::Primary, "").unwrap().is_empty());
    }

    #[test]
    fn test_normalize_patch() {
        let mut patch = SlicePatch::new()
            .set(TOOTH_CAVITY_PERMANENT, "21,11")
            .clear(TOOTH_CAVITY_PRIMARY)
            .set("plaque", "Present");
        normalize_patch(&mut patch).unwrap();
        assert_eq!(
            patch.get(TOOTH_CAVITY_PERMANENT),
            Some(&Some(Value::String("11,21".to_string())))
        );
        assert_eq!(patch.get(TOOTH_CAVITY_PRIMARY), Some(&None));

        let mut bad = SlicePatch::new().set(TOOTH_CAVITY_PRIMARY, 55);
        assert!(normalize_patch(&mut bad).is_err());
    }

    #[test]
    fn test_all_groups_selected() {
        let selection = ToothSelection::parse(Dentition::Primary, "55,61,85").unwrap();
        assert!(!selection.all_groups_selected());
        let selection = ToothSelection::parse(Dentition::Primary, "55,61,85,71").unwrap();
        assert!(selection.all_groups_selected());
    }

    fn permanent_code() -> impl Strategy<Value = &'static str> {
        let codes: Vec<_> = PERMANENT_GROUPS.iter().flat_map(|g| g.iter().copied()).collect();
        proptest::sample::select(codes)
    }

    proptest! {
        #[test]
        fn prop_double_toggle_is_identity(
            start in proptest::sample::subsequence(
                PERMANENT_GROUPS.iter().flat_map(|g| g.iter().copied()).collect::<Vec<_>>(),
                0..10,
            ),
            code in permanent_code(),
        ) {
            let original = ToothSelection::parse(Dentition::Permanent, &start.join(",")).unwrap();
            let mut selection = original.clone();
            selection.toggle(code).unwrap();
            selection.toggle(code).unwrap();
            // Re-adding appends to the end of its group, so compare as sets per group
            for index in 0..GROUP_COUNT {
                let mut before = original.group(index).to_vec();
                let mut after = selection.group(index).to_vec();
                before.sort();
                after.sort();
                prop_assert_eq!(before, after);
            }
        }
    }
}
