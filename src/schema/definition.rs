// Schema definition: ordered field descriptors ("controls")
// Pure data. Persistence lives in schema::store.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::datetime::parse_date_time;
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Text,
    Note,
    Counter,
    Flag,
    FixedChoice,
    DateTime,
    File,
    RelativePath,
    DeleteFlag,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Text => "Text",
            ValueType::Note => "Note",
            ValueType::Counter => "Counter",
            ValueType::Flag => "Flag",
            ValueType::FixedChoice => "FixedChoice",
            ValueType::DateTime => "DateTime",
            ValueType::File => "File",
            ValueType::RelativePath => "RelativePath",
            ValueType::DeleteFlag => "DeleteFlag",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Text" => ValueType::Text,
            "Note" => ValueType::Note,
            "Counter" => ValueType::Counter,
            "Flag" => ValueType::Flag,
            "FixedChoice" => ValueType::FixedChoice,
            "DateTime" => ValueType::DateTime,
            "File" => ValueType::File,
            "RelativePath" => ValueType::RelativePath,
            "DeleteFlag" => ValueType::DeleteFlag,
            _ => return None,
        })
    }

    /// The four standard fields every image template carries.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ValueType::File | ValueType::RelativePath | ValueType::DateTime | ValueType::DeleteFlag
        )
    }

    /// Compared numerically in selections.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Counter)
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            ValueType::Counter => "0",
            ValueType::Flag | ValueType::DeleteFlag => FLAG_FALSE,
            ValueType::DateTime => DEFAULT_DATE_TIME,
            _ => "",
        }
    }

    fn default_width(&self) -> i64 {
        match self {
            ValueType::Counter | ValueType::Flag | ValueType::DeleteFlag => 40,
            ValueType::DateTime => 130,
            _ => 100,
        }
    }

    /// SQL column type in DataTable.
    pub fn column_type(&self) -> &'static str {
        match self {
            ValueType::DateTime => "DATETIME",
            _ => "TEXT",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field ("control") of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub data_label: String,
    pub label: String,
    pub value_type: ValueType,
    pub default_value: String,
    pub control_order: i64,
    pub spreadsheet_order: i64,
    pub tooltip: String,
    pub width: i64,
    pub copyable: bool,
    pub visible: bool,
    pub exportable: bool,
    pub choices: Vec<String>,
}

impl FieldDescriptor {
    /// A new field with type defaults. Order indices are assigned when the
    /// field is added to a definition.
    pub fn new(data_label: impl Into<String>, value_type: ValueType) -> Self {
        let data_label = data_label.into();
        Self {
            label: data_label.clone(),
            data_label,
            value_type,
            default_value: value_type.default_value().to_string(),
            control_order: 0,
            spreadsheet_order: 0,
            tooltip: String::new(),
            width: value_type.default_width(),
            copyable: !value_type.is_structural(),
            visible: true,
            exportable: true,
            choices: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = value.into();
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tooltip(mut self, tooltip: impl Into<String>) -> Self {
        self.tooltip = tooltip.into();
        self
    }

    pub fn not_exported(mut self) -> Self {
        self.exportable = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn is_structural(&self) -> bool {
        self.value_type.is_structural()
    }

    /// Whether `value` is acceptable for this field.
    pub fn accepts(&self, value: &str) -> bool {
        match self.value_type {
            ValueType::Flag | ValueType::DeleteFlag => parse_flag(value).is_some(),
            ValueType::Counter => {
                let v = value.trim();
                v.is_empty() || v.parse::<i64>().is_ok()
            }
            ValueType::FixedChoice => value.is_empty() || self.choices.iter().any(|c| c == value),
            ValueType::DateTime => parse_date_time(value).is_some(),
            _ => true,
        }
    }

    /// The stored form of an accepted value: flags lowercase, counters trimmed.
    pub fn normalize(&self, value: &str) -> Result<String> {
        if !self.accepts(value) {
            return Err(StoreError::InvalidValue {
                label: self.data_label.clone(),
                value: value.to_string(),
            });
        }
        Ok(match self.value_type {
            ValueType::Flag | ValueType::DeleteFlag => flag_text(parse_flag(value).unwrap_or(false)).to_string(),
            ValueType::Counter => value.trim().to_string(),
            ValueType::DateTime => crate::datetime::normalize_date_time(value)
                .unwrap_or_else(|| value.to_string()),
            _ => value.to_string(),
        })
    }

    /// Names of the display-only attributes that differ from `other`.
    pub fn cosmetic_differences(&self, other: &FieldDescriptor) -> Vec<String> {
        let mut diffs = Vec::new();
        if self.label != other.label {
            diffs.push(LABEL);
        }
        if self.default_value != other.default_value {
            diffs.push(DEFAULT_VALUE);
        }
        if self.tooltip != other.tooltip {
            diffs.push(TOOLTIP);
        }
        if self.width != other.width {
            diffs.push(WIDTH);
        }
        if self.visible != other.visible {
            diffs.push(VISIBLE);
        }
        if self.copyable != other.copyable {
            diffs.push(COPYABLE);
        }
        if self.exportable != other.exportable {
            diffs.push(EXPORT_TO_CSV);
        }
        if self.control_order != other.control_order {
            diffs.push(CONTROL_ORDER);
        }
        if self.spreadsheet_order != other.spreadsheet_order {
            diffs.push(SPREADSHEET_ORDER);
        }
        if self.choices != other.choices {
            diffs.push(LIST);
        }
        diffs.into_iter().map(str::to_string).collect()
    }

    /// Copy every display-only attribute from `other`, keeping identity and type.
    pub fn copy_cosmetics_from(&mut self, other: &FieldDescriptor) {
        self.label = other.label.clone();
        self.default_value = other.default_value.clone();
        self.tooltip = other.tooltip.clone();
        self.width = other.width;
        self.visible = other.visible;
        self.copyable = other.copyable;
        self.exportable = other.exportable;
        self.control_order = other.control_order;
        self.spreadsheet_order = other.spreadsheet_order;
        self.choices = other.choices.clone();
    }
}

/// Stored text of a flag.
pub fn flag_text(value: bool) -> &'static str {
    if value {
        FLAG_TRUE
    } else {
        FLAG_FALSE
    }
}

/// Parse a flag value, case-insensitively.
pub fn parse_flag(value: &str) -> Option<bool> {
    let v = value.trim();
    if v.eq_ignore_ascii_case(FLAG_TRUE) {
        Some(true)
    } else if v.eq_ignore_ascii_case(FLAG_FALSE) {
        Some(false)
    } else {
        None
    }
}

/// Ordered set of fields, kept sorted by control order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    fields: Vec<FieldDescriptor>,
}

impl SchemaDefinition {
    /// Empty definition, as used by folder level templates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Image template holding only the four standard fields.
    pub fn image_template() -> Self {
        let mut schema = Self::new();
        for (label, value_type) in [
            (FILE, ValueType::File),
            (RELATIVE_PATH, ValueType::RelativePath),
            (DATE_TIME, ValueType::DateTime),
            (DELETE_FLAG, ValueType::DeleteFlag),
        ] {
            let mut field = FieldDescriptor::new(label, value_type);
            if value_type == ValueType::DeleteFlag {
                field.label = "Delete?".to_string();
            }
            // Fresh definition, labels are unique.
            schema.append(field);
        }
        schema
    }

    /// Build from fields as stored (orders taken as-is).
    pub fn from_fields(mut fields: Vec<FieldDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for f in &fields {
            if !seen.insert(f.data_label.as_str()) {
                return Err(StoreError::DuplicateField(f.data_label.clone()));
            }
        }
        fields.sort_by_key(|f| f.control_order);
        Ok(Self { fields })
    }

    /// Fields in control order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, data_label: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.data_label == data_label)
    }

    pub fn get_mut(&mut self, data_label: &str) -> Option<&mut FieldDescriptor> {
        self.fields.iter_mut().find(|f| f.data_label == data_label)
    }

    /// Field or `UnknownField`.
    pub fn require(&self, data_label: &str) -> Result<&FieldDescriptor> {
        self.get(data_label)
            .ok_or_else(|| StoreError::UnknownField(data_label.to_string()))
    }

    pub fn contains(&self, data_label: &str) -> bool {
        self.get(data_label).is_some()
    }

    pub fn data_labels(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.data_label.as_str()).collect()
    }

    pub fn counters(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.value_type == ValueType::Counter)
    }

    /// Every field except the four standard ones.
    pub fn in_spreadsheet_order(&self) -> Vec<&FieldDescriptor> {
        let mut fields: Vec<&FieldDescriptor> = self.fields.iter().collect();
        fields.sort_by_key(|f| (f.spreadsheet_order, f.control_order));
        fields
    }

    pub fn exportable_in_spreadsheet_order(&self) -> Vec<&FieldDescriptor> {
        self.in_spreadsheet_order()
            .into_iter()
            .filter(|f| f.exportable)
            .collect()
    }

    pub fn has_standard_fields(&self) -> bool {
        STANDARD_FIELDS.iter().all(|l| self.contains(l))
    }

    /// Append a field at the end of both orders.
    pub fn add(&mut self, field: FieldDescriptor) -> Result<&FieldDescriptor> {
        if self.contains(&field.data_label) {
            return Err(StoreError::DuplicateField(field.data_label));
        }
        if field.data_label.trim().is_empty() {
            return Err(StoreError::InvalidValue {
                label: DATA_LABEL.to_string(),
                value: field.data_label,
            });
        }
        Ok(self.append(field))
    }

    fn append(&mut self, mut field: FieldDescriptor) -> &FieldDescriptor {
        field.control_order = self.fields.iter().map(|f| f.control_order).max().unwrap_or(0) + 1;
        field.spreadsheet_order = self.fields.iter().map(|f| f.spreadsheet_order).max().unwrap_or(0) + 1;
        self.fields.push(field);
        let last = self.fields.len() - 1;
        &self.fields[last]
    }

    /// Remove a field. Standard fields cannot be removed.
    pub fn remove(&mut self, data_label: &str) -> Result<FieldDescriptor> {
        let index = self
            .fields
            .iter()
            .position(|f| f.data_label == data_label)
            .ok_or_else(|| StoreError::UnknownField(data_label.to_string()))?;
        if self.fields[index].is_structural() {
            return Err(StoreError::StructuralField(data_label.to_string()));
        }
        let removed = self.fields.remove(index);
        self.renumber();
        Ok(removed)
    }

    /// Change a field's data label in place.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        if self.contains(to) {
            return Err(StoreError::DuplicateField(to.to_string()));
        }
        let field = self
            .get_mut(from)
            .ok_or_else(|| StoreError::UnknownField(from.to_string()))?;
        if field.is_structural() {
            return Err(StoreError::StructuralField(from.to_string()));
        }
        if field.label == field.data_label {
            field.label = to.to_string();
        }
        field.data_label = to.to_string();
        Ok(())
    }

    /// Make both order indices contiguous 1..N, keeping relative order.
    pub fn renumber(&mut self) {
        self.fields.sort_by_key(|f| f.control_order);
        for (i, f) in self.fields.iter_mut().enumerate() {
            f.control_order = i as i64 + 1;
        }
        let mut by_sheet: Vec<usize> = (0..self.fields.len()).collect();
        by_sheet.sort_by_key(|&i| (self.fields[i].spreadsheet_order, self.fields[i].control_order));
        for (rank, i) in by_sheet.into_iter().enumerate() {
            self.fields[i].spreadsheet_order = rank as i64 + 1;
        }
    }
}

/// Stored form of a choice list.
pub fn encode_choices(choices: &[String]) -> String {
    if choices.is_empty() {
        String::new()
    } else {
        serde_json::to_string(choices).unwrap_or_default()
    }
}

/// Reads the JSON array form and the older '|'-separated form.
pub fn decode_choices(stored: &str) -> Vec<String> {
    let stored = stored.trim();
    if stored.is_empty() {
        return Vec::new();
    }
    if stored.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(stored) {
            return list;
        }
    }
    stored.split('|').map(str::to_string).collect()
}
