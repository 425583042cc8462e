//! Ordered field layout shared by every table.
//!
//! A schema lists dimensions and metrics in the exact order they appear in
//! an inbound message. Dimensions contribute a fixed-width part to the
//! packed sample key; metrics contribute one aggregate slot each. Indices are
//! counted separately per kind, so in `dim1, m1, dim2` the dimensions are
//! `0` and `1` and the metric is `0`.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::limits::MAX_COLLAPSE_LEVEL;
use super::sample_key::MAX_KEY_PART_BITS;

/// Converts raw dimension bytes straight to a key code.
pub type DataToCodeFn = Arc<dyn Fn(&[u8]) -> Result<u32, TransformError> + Send + Sync>;

/// Converts a key code back to its published value.
pub type CodeToValueFn = Arc<dyn Fn(u32) -> Result<String, TransformError> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("invalid integer dimension value {value:?}")]
    InvalidInteger { value: String },

    #[error("{0}")]
    Custom(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("dimension {name} collapsing level {level} is greater than maximum allowed value 100")]
    CollapsingLevelTooHigh { name: String, level: u32 },

    #[error("dimension {name} key bit size {bits} must be between 1 and 32")]
    InvalidKeyBitSize { name: String, bits: u32 },

    #[error("duplicate field name {name}")]
    DuplicateField { name: String },
}

/// Optional pair of functions that let a dimension bypass the lookup table.
#[derive(Clone, Default)]
pub struct DimensionTransform {
    pub from_data: Option<DataToCodeFn>,
    pub to_value: Option<CodeToValueFn>,
}

impl fmt::Debug for DimensionTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DimensionTransform")
            .field("from_data", &self.from_data.is_some())
            .field("to_value", &self.to_value.is_some())
            .finish()
    }
}

/// Transform for dimensions whose values are small integers written in hex.
pub fn integer_transform() -> DimensionTransform {
    DimensionTransform {
        from_data: Some(Arc::new(integer_from_data)),
        to_value: Some(Arc::new(integer_to_value)),
    }
}

fn integer_from_data(data: &[u8]) -> Result<u32, TransformError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| TransformError::InvalidInteger {
            value: String::from_utf8_lossy(data).into_owned(),
        })
}

fn integer_to_value(code: u32) -> Result<String, TransformError> {
    Ok(code.to_string())
}

#[derive(Debug, Clone)]
pub struct DimensionAttrs {
    max_size: u32,
    key_bit_size: u32,
    key_bit_position: usize,
    collapsing_level: Option<u32>,
    transform: Option<DimensionTransform>,
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    Dimension(DimensionAttrs),
    Metric,
}

/// A single schema column.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    index: usize,
    kind: FieldKind,
}

impl Field {
    /// Dimension expected to take at most `max_size` distinct values.
    ///
    /// The key width defaults to `floor(log2(max_size)) + 1` bits.
    pub fn dimension(name: impl Into<String>, max_size: u32) -> Self {
        Self {
            name: name.into(),
            index: 0,
            kind: FieldKind::Dimension(DimensionAttrs {
                max_size,
                key_bit_size: u32::BITS - max_size.leading_zeros(),
                key_bit_position: 0,
                collapsing_level: None,
                transform: None,
            }),
        }
    }

    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: 0,
            kind: FieldKind::Metric,
        }
    }

    /// Level above which this dimension is forced to `AGGR`. No effect on metrics.
    pub fn with_collapsing_level(mut self, level: u32) -> Self {
        if let FieldKind::Dimension(attrs) = &mut self.kind {
            attrs.collapsing_level = Some(level);
        }
        self
    }

    pub fn with_key_bit_size(mut self, bits: u32) -> Self {
        if let FieldKind::Dimension(attrs) = &mut self.kind {
            attrs.key_bit_size = bits;
        }
        self
    }

    pub fn with_transform(mut self, transform: DimensionTransform) -> Self {
        if let FieldKind::Dimension(attrs) = &mut self.kind {
            attrs.transform = Some(transform);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position among fields of the same kind.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_dimension(&self) -> bool {
        matches!(self.kind, FieldKind::Dimension(_))
    }

    fn dimension_attrs(&self) -> Option<&DimensionAttrs> {
        match &self.kind {
            FieldKind::Dimension(attrs) => Some(attrs),
            FieldKind::Metric => None,
        }
    }

    /// Declared cardinality; zero for metrics.
    pub fn max_size(&self) -> u32 {
        self.dimension_attrs().map_or(0, |a| a.max_size)
    }

    /// Key width in bits; zero for metrics.
    pub fn key_bit_size(&self) -> u32 {
        self.dimension_attrs().map_or(0, |a| a.key_bit_size)
    }

    /// Bit offset of this dimension inside the packed key.
    pub fn key_bit_position(&self) -> usize {
        self.dimension_attrs().map_or(0, |a| a.key_bit_position)
    }

    pub fn collapsing_level(&self) -> Option<u32> {
        self.dimension_attrs().and_then(|a| a.collapsing_level)
    }

    pub fn transform(&self) -> Option<&DimensionTransform> {
        self.dimension_attrs().and_then(|a| a.transform.as_ref())
    }

    /// True when the table's current collapsing `level` exceeds this
    /// dimension's configured level. Dimensions without a level never collapse.
    pub fn should_collapse(&self, level: u32) -> bool {
        self.collapsing_level().is_some_and(|own| level > own)
    }
}

/// Immutable, validated field layout.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<Field>,
    dimensions: Vec<usize>,
    metrics: Vec<usize>,
    key_size: usize,
    key_part_sizes: Vec<u32>,
}

impl Schema {
    /// Assigns indices and key offsets, and validates every dimension.
    pub fn new(fields: Vec<Field>) -> Result<Self, SchemaError> {
        let mut fields = fields;
        let mut dimensions = Vec::new();
        let mut metrics = Vec::new();
        let mut key_part_sizes = Vec::new();
        let mut key_size = 0usize;

        for i in 0..fields.len() {
            let name = fields[i].name.clone();
            if fields[..i].iter().any(|f| f.name == name) {
                return Err(SchemaError::DuplicateField { name });
            }

            let field = &mut fields[i];
            match &mut field.kind {
                FieldKind::Dimension(attrs) => {
                    if let Some(level) = attrs.collapsing_level {
                        if level > MAX_COLLAPSE_LEVEL {
                            return Err(SchemaError::CollapsingLevelTooHigh { name, level });
                        }
                    }
                    if attrs.key_bit_size == 0 || attrs.key_bit_size > MAX_KEY_PART_BITS {
                        return Err(SchemaError::InvalidKeyBitSize {
                            name,
                            bits: attrs.key_bit_size,
                        });
                    }

                    attrs.key_bit_position = key_size;
                    key_size += attrs.key_bit_size as usize;
                    key_part_sizes.push(attrs.key_bit_size);
                    field.index = dimensions.len();
                    dimensions.push(i);
                }
                FieldKind::Metric => {
                    field.index = metrics.len();
                    metrics.push(i);
                }
            }
        }

        Ok(Self {
            fields,
            dimensions,
            metrics,
            key_size,
            key_part_sizes,
        })
    }

    /// All fields in message order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, i: usize) -> Option<&Field> {
        self.fields.get(i)
    }

    /// Dimension with dimension index `i`.
    pub fn dimension(&self, i: usize) -> Option<&Field> {
        self.dimensions.get(i).map(|&f| &self.fields[f])
    }

    /// Metric with metric index `i`.
    pub fn metric(&self, i: usize) -> Option<&Field> {
        self.metrics.get(i).map(|&f| &self.fields[f])
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Field> {
        self.dimensions.iter().map(|&f| &self.fields[f])
    }

    pub fn metrics(&self) -> impl Iterator<Item = &Field> {
        self.metrics.iter().map(|&f| &self.fields[f])
    }

    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }

    pub fn num_metrics(&self) -> usize {
        self.metrics.len()
    }

    /// Total packed key width in bits.
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Per-dimension key widths in dimension order.
    pub fn dimension_key_part_sizes(&self) -> &[u32] {
        &self.key_part_sizes
    }
}

/// Fluent schema construction.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: Vec<Field>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimension(self, name: impl Into<String>, max_size: u32) -> Self {
        self.field(Field::dimension(name, max_size))
    }

    /// Dimension holding hex-encoded integers, resolved without a lookup table.
    pub fn integer_dimension(self, name: impl Into<String>, max_size: u32) -> Self {
        self.field(Field::dimension(name, max_size).with_transform(integer_transform()))
    }

    pub fn metric(self, name: impl Into<String>) -> Self {
        self.field(Field::metric(name))
    }

    /// Appends a fully configured field.
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        Schema::new(self.fields)
    }
}
