//! Department screen schemas
//!
//! Bound fields, defaults and required-field lists of each examination
//! screen. Validation is a presence check: a required field must hold a
//! non-empty value.

use crate::dental::{
    Dentition, ToothSelection, GROUP_COUNT, TOOTH_CAVITY_PERMANENT, TOOTH_CAVITY_PRIMARY,
};
use crate::error::{SyncError, SyncResult};
use crate::photo::{PHOTO, PHOTO_FILE_NAME};
use crate::record::Department;
use serde_json::Value;
use std::collections::BTreeMap;

/// Field layout of one department screen
#[derive(Debug)]
pub struct FormSchema {
    pub department: Department,
    /// Fields that must be non-empty before saving
    pub required: &'static [&'static str],
    /// Bound fields that may stay empty
    pub optional: &'static [&'static str],
    /// Initial values after load and after each reset
    pub defaults: &'static [(&'static str, &'static str)],
    /// Every tooth group of both dentitions needs a selection
    pub requires_tooth_groups: bool,
}

pub const IT_SCHEMA: FormSchema = FormSchema {
    department: Department::It,
    required: &[
        "name",
        "div",
        "roll_no",
        "admin_no",
        "father_name",
        "mother_name",
        "address",
        "mobile",
        "dob",
        "gender",
        "blood_group",
        PHOTO,
    ],
    optional: &[PHOTO_FILE_NAME],
    defaults: &[],
    requires_tooth_groups: false,
};

pub const ENT_SCHEMA: FormSchema = FormSchema {
    department: Department::Ent,
    required: &[
        "left_ear_deformity",
        "left_ear_wax",
        "left_ear_tympanic_membrane",
        "left_ear_discharge",
        "left_ear_normal_hearing",
        "right_ear_deformity",
        "right_ear_wax",
        "right_ear_tympanic_membrane",
        "right_ear_discharge",
        "right_ear_normal_hearing",
        "left_nose_obstruction",
        "left_nose_discharge",
        "right_nose_obstruction",
        "right_nose_discharge",
        "throat",
        "throat_pain",
        "neck_nodes",
        "tonsils",
    ],
    optional: &[],
    defaults: &[],
    requires_tooth_groups: false,
};

pub const VISION_SCHEMA: FormSchema = FormSchema {
    department: Department::Vision,
    required: &[
        "re_vision",
        "re_color_blindness",
        "re_squint",
        "le_vision",
        "le_color_blindness",
        "le_squint",
    ],
    optional: &[],
    defaults: &[("re_vision", "6/6"), ("le_vision", "6/6")],
    requires_tooth_groups: false,
};

pub const GENERAL_SCHEMA: FormSchema = FormSchema {
    department: Department::General,
    required: &[
        "height",
        "weight",
        "bmi",
        "nails",
        "hair",
        "skin",
        "anemia_figure",
        "allergy",
        "abdomen_soft",
        "abdomen_hard",
        "abdomen_distended",
        "abdomen_bowel_sound",
        "cns_conscious",
        "cns_oriented",
        "cns_playful",
        "cns_active",
        "cns_alert",
        "cns_speech",
        "past_medical",
        "past_surgical",
        "bp",
        "pulse",
        "hip",
        "waist",
    ],
    optional: &[],
    defaults: &[],
    requires_tooth_groups: false,
};

pub const DENTAL_SCHEMA: FormSchema = FormSchema {
    department: Department::Dental,
    required: &[
        "dental_extra_oral",
        "plaque",
        "gum_inflammation",
        "stains",
        "tooth_discoloration",
        "tarter",
        "bad_breath",
        "gum_bleeding",
        "soft_tissue",
        "fluorosis",
        "malocclusion",
        "root_stump",
        "missing_teeth",
    ],
    optional: &[TOOTH_CAVITY_PERMANENT, TOOTH_CAVITY_PRIMARY],
    defaults: &[],
    requires_tooth_groups: true,
};

impl FormSchema {
    pub fn for_department(department: Department) -> &'static FormSchema {
        match department {
            Department::It => &IT_SCHEMA,
            Department::Ent => &ENT_SCHEMA,
            Department::Vision => &VISION_SCHEMA,
            Department::General => &GENERAL_SCHEMA,
            Department::Dental => &DENTAL_SCHEMA,
        }
    }

    /// All bound fields, required first
    pub fn fields(&self) -> impl Iterator<Item = &'static str> {
        let required: &'static [&'static str] = self.required;
        let optional: &'static [&'static str] = self.optional;
        required.iter().chain(optional.iter()).copied()
    }

    pub fn is_bound(&self, field: &str) -> bool {
        self.fields().any(|f| f == field)
    }

    pub fn default_values(&self) -> BTreeMap<String, Value> {
        self.defaults
            .iter()
            .map(|(field, value)| ((*field).to_string(), Value::from(*value)))
            .collect()
    }

    /// Required entries that are absent or empty in `values`
    pub fn missing_fields(&self, values: &BTreeMap<String, Value>) -> Vec<String> {
        let mut missing: Vec<String> = self
            .required
            .iter()
            .filter(|field| !values.get(**field).is_some_and(is_filled))
            .map(|field| (*field).to_string())
            .collect();

        if self.requires_tooth_groups {
            for dentition in Dentition::ALL {
                let selection = ToothSelection::from_value(dentition, values.get(dentition.field()))
                    .unwrap_or_else(|_| ToothSelection::empty(dentition));
                for index in 0..GROUP_COUNT {
                    if selection.group(index).is_empty() {
                        missing.push(format!("{}Group{}", dentition.field(), index + 1));
                    }
                }
            }
        }
        missing
    }

    /// Presence check over every required field.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] listing the missing fields.
    pub fn validate(&self, values: &BTreeMap<String, Value>) -> SyncResult<()> {
        let missing = self.missing_fields(values);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Validation {
                department: self.department,
                missing,
            })
        }
    }
}

fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filled(schema: &FormSchema) -> BTreeMap<String, Value> {
        schema
            .required
            .iter()
            .map(|field| ((*field).to_string(), json!("x")))
            .collect()
    }

    #[test]
    fn test_every_department_has_schema() {
        for department in Department::ALL {
            assert_eq!(FormSchema::for_department(department).department, department);
        }
    }

    #[test]
    fn test_vision_defaults() {
        let defaults = VISION_SCHEMA.default_values();
        assert_eq!(defaults.get("re_vision"), Some(&json!("6/6")));
        assert_eq!(
            VISION_SCHEMA.missing_fields(&defaults),
            vec!["re_color_blindness", "re_squint", "le_color_blindness", "le_squint"]
        );
    }

    #[test]
    fn test_blank_strings_are_missing() {
        let mut values = filled(&ENT_SCHEMA);
        values.insert("tonsils".to_string(), json!("  "));
        let err = ENT_SCHEMA.validate(&values).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation { department: Department::Ent, ref missing }
                if missing == &["tonsils"]
        ));
    }

    #[test]
    fn test_dental_requires_every_tooth_group() {
        let mut values = filled(&DENTAL_SCHEMA);
        values.insert(TOOTH_CAVITY_PERMANENT.to_string(), json!("11,21,48,31"));
        values.insert(TOOTH_CAVITY_PRIMARY.to_string(), json!("55,61,85"));

        assert_eq!(
            DENTAL_SCHEMA.missing_fields(&values),
            vec!["toothCavityPrimaryGroup4".to_string()]
        );

        values.insert(TOOTH_CAVITY_PRIMARY.to_string(), json!("55,61,85,71"));
        assert!(DENTAL_SCHEMA.validate(&values).is_ok());
    }

    #[test]
    fn test_it_requires_photo() {
        let mut values = filled(&IT_SCHEMA);
        values.remove(PHOTO);
        assert_eq!(IT_SCHEMA.missing_fields(&values), vec![PHOTO.to_string()]);
        assert!(IT_SCHEMA.is_bound(PHOTO_FILE_NAME));
        assert!(!IT_SCHEMA.is_bound("throat"));
    }
}
