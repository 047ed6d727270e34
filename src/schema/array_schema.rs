//! Array Schema
//!
//! `RawArraySchema` carries the caller's parallel-array description;
//! `ArraySchema::new` validates it once and yields the immutable schema that
//! every session shares.
//!
//! ## Persisted Form
//! The raw description is what gets persisted (framed by `codec`), so a
//! loaded schema goes through exactly the same validation as a new one.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::buffer::AttributeLayout;
use crate::codec;
use crate::error::{AtlasError, Result};

use super::{
    key_in_box, CellOrder, CellValNum, Compression, Datatype, Domain, KeyBox, TileExtents,
    TileOrder,
};

/// Name under which the coordinates are addressed as an attribute
pub const COORDS_ATTRIBUTE: &str = "__coords";

/// Cells per sparse tile when the caller does not say otherwise
pub const DEFAULT_CAPACITY: u64 = 10_000;

/// Names with this prefix are reserved for internal attributes
pub(crate) const RESERVED_PREFIX: &str = "__";

const SCHEMA_MAGIC: &[u8; 4] = b"ATAS";

// =============================================================================
// Raw Schema
// =============================================================================

/// Caller-supplied schema description.
///
/// `types` and `compression` hold one entry per attribute plus a trailing
/// entry for the coordinates; `cell_val_num` holds one entry per attribute.
/// `None` means the default for every slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawArraySchema {
    pub name: String,
    pub attributes: Vec<String>,
    pub dimensions: Vec<String>,
    pub dense: bool,
    pub domain: Domain,
    pub tile_extents: Option<TileExtents>,
    pub types: Vec<Datatype>,
    pub cell_val_num: Option<Vec<CellValNum>>,
    pub cell_order: CellOrder,
    pub tile_order: TileOrder,
    pub capacity: Option<u64>,
    pub compression: Option<Vec<Compression>>,
}

impl RawArraySchema {
    /// Sparse array with one value per cell, row-major orders, no compression
    pub fn sparse(
        name: &str,
        attributes: &[&str],
        dimensions: &[&str],
        domain: Domain,
        types: &[Datatype],
    ) -> Self {
        Self {
            name: name.to_string(),
            attributes: attributes.iter().map(|s| s.to_string()).collect(),
            dimensions: dimensions.iter().map(|s| s.to_string()).collect(),
            dense: false,
            domain,
            tile_extents: None,
            types: types.to_vec(),
            cell_val_num: None,
            cell_order: CellOrder::RowMajor,
            tile_order: TileOrder::RowMajor,
            capacity: None,
            compression: None,
        }
    }

    /// Dense array over a regular tile grid
    pub fn dense(
        name: &str,
        attributes: &[&str],
        dimensions: &[&str],
        domain: Domain,
        tile_extents: TileExtents,
        types: &[Datatype],
    ) -> Self {
        Self {
            dense: true,
            tile_extents: Some(tile_extents),
            ..Self::sparse(name, attributes, dimensions, domain, types)
        }
    }
}

// =============================================================================
// Validated Schema
// =============================================================================

/// One attribute of a validated schema
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub cell_val_num: CellValNum,
    pub compression: Compression,
}

impl Attribute {
    /// Bytes per cell, or `None` for variable-length attributes
    pub fn cell_size(&self) -> Option<usize> {
        match self.cell_val_num {
            CellValNum::Fixed(n) => Some(n as usize * self.datatype.size()),
            CellValNum::Var => None,
        }
    }
}

/// Validated, immutable array schema
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySchema {
    name: String,
    attributes: Vec<Attribute>,
    dimensions: Vec<String>,
    dense: bool,
    domain: Domain,
    tile_extents: Option<TileExtents>,
    coords_compression: Compression,
    cell_order: CellOrder,
    tile_order: TileOrder,
    capacity: u64,
}

impl ArraySchema {
    /// Validate a raw description
    pub fn new(raw: RawArraySchema) -> Result<Self> {
        Self::validate(raw, false)
    }

    /// Validate a description that may use reserved names (internal arrays)
    pub(crate) fn new_internal(raw: RawArraySchema) -> Result<Self> {
        Self::validate(raw, true)
    }

    fn validate(raw: RawArraySchema, allow_reserved: bool) -> Result<Self> {
        let fail = |msg: String| Err(AtlasError::Schema(msg));

        if raw.name.is_empty() {
            return fail("array name is empty".to_string());
        }
        if raw.attributes.is_empty() {
            return fail("at least one attribute is required".to_string());
        }
        if raw.dimensions.is_empty() {
            return fail("at least one dimension is required".to_string());
        }

        let mut seen = HashSet::new();
        for name in raw.attributes.iter().chain(raw.dimensions.iter()) {
            if let Err(msg) = check_name(name, allow_reserved) {
                return fail(msg);
            }
            if !seen.insert(name.as_str()) {
                return fail(format!("duplicate attribute or dimension name '{}'", name));
            }
        }

        let attr_num = raw.attributes.len();
        let dim_num = raw.dimensions.len();

        if raw.types.len() != attr_num + 1 {
            return fail(format!(
                "expected {} types (attributes + coordinates), got {}",
                attr_num + 1,
                raw.types.len()
            ));
        }
        let cell_val_num = raw
            .cell_val_num
            .clone()
            .unwrap_or_else(|| vec![CellValNum::Fixed(1); attr_num]);
        if cell_val_num.len() != attr_num {
            return fail(format!(
                "expected {} cell_val_num entries, got {}",
                attr_num,
                cell_val_num.len()
            ));
        }
        if let Some(pos) = cell_val_num.iter().position(|c| *c == CellValNum::Fixed(0)) {
            return fail(format!(
                "attribute '{}' stores zero values per cell",
                raw.attributes[pos]
            ));
        }
        let compression = raw
            .compression
            .clone()
            .unwrap_or_else(|| vec![Compression::None; attr_num + 1]);
        if compression.len() != attr_num + 1 {
            return fail(format!(
                "expected {} compression entries (attributes + coordinates), got {}",
                attr_num + 1,
                compression.len()
            ));
        }

        let coords_type = raw.types[attr_num];
        if !coords_type.is_numeric() {
            return fail(format!("coordinate type {:?} is not numeric", coords_type));
        }
        if raw.domain.datatype() != coords_type {
            return fail(format!(
                "domain type {:?} differs from coordinate type {:?}",
                raw.domain.datatype(),
                coords_type
            ));
        }
        if raw.domain.dim_num() != dim_num {
            return fail(format!(
                "domain has {} ranges for {} dimensions",
                raw.domain.dim_num(),
                dim_num
            ));
        }
        if let Err(msg) = raw.domain.check() {
            return fail(format!("invalid domain: {}", msg));
        }

        if let Some(extents) = &raw.tile_extents {
            if let Err(msg) = check_extents(&raw.domain, extents) {
                return fail(msg);
            }
        }
        if raw.dense {
            if raw.tile_extents.is_none() {
                return fail("dense arrays require tile extents".to_string());
            }
            if !coords_type.is_integer() {
                return fail("dense arrays require an integer coordinate type".to_string());
            }
        }

        let capacity = raw.capacity.unwrap_or(DEFAULT_CAPACITY);
        if capacity == 0 {
            return fail("capacity must be positive".to_string());
        }

        let attributes = raw
            .attributes
            .iter()
            .enumerate()
            .map(|(i, name)| Attribute {
                name: name.clone(),
                datatype: raw.types[i],
                cell_val_num: cell_val_num[i],
                compression: compression[i],
            })
            .collect();

        Ok(Self {
            name: raw.name,
            attributes,
            dimensions: raw.dimensions,
            dense: raw.dense,
            domain: raw.domain,
            tile_extents: raw.tile_extents,
            coords_compression: compression[attr_num],
            cell_order: raw.cell_order,
            tile_order: raw.tile_order,
            capacity,
        })
    }

    /// The raw description this schema was built from (defaults filled in)
    pub fn to_raw(&self) -> RawArraySchema {
        let mut types: Vec<Datatype> = self.attributes.iter().map(|a| a.datatype).collect();
        types.push(self.coords_type());
        let mut compression: Vec<Compression> =
            self.attributes.iter().map(|a| a.compression).collect();
        compression.push(self.coords_compression);

        RawArraySchema {
            name: self.name.clone(),
            attributes: self.attributes.iter().map(|a| a.name.clone()).collect(),
            dimensions: self.dimensions.clone(),
            dense: self.dense,
            domain: self.domain.clone(),
            tile_extents: self.tile_extents.clone(),
            types,
            cell_val_num: Some(self.attributes.iter().map(|a| a.cell_val_num).collect()),
            cell_order: self.cell_order,
            tile_order: self.tile_order,
            capacity: Some(self.capacity),
            compression: Some(compression),
        }
    }

    /// Stable, checksummed encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode_framed(SCHEMA_MAGIC, &self.to_raw())
    }

    /// Decode and re-validate a persisted schema
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: RawArraySchema = codec::decode_framed(SCHEMA_MAGIC, bytes)?;
        Self::new(raw)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute_num(&self) -> usize {
        self.attributes.len()
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_dense(&self) -> bool {
        self.dense
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn tile_extents(&self) -> Option<&TileExtents> {
        self.tile_extents.as_ref()
    }

    pub fn coords_type(&self) -> Datatype {
        self.domain.datatype()
    }

    pub fn coords_compression(&self) -> Compression {
        self.coords_compression
    }

    /// Bytes of one coordinate tuple
    pub fn coords_size(&self) -> usize {
        self.dim_num() * self.coords_type().size()
    }

    pub fn cell_order(&self) -> CellOrder {
        self.cell_order
    }

    pub fn tile_order(&self) -> TileOrder {
        self.tile_order
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Index of an attribute; the coordinates are index `attribute_num()`
    pub fn attribute_index(&self, name: &str) -> Result<usize> {
        if name == COORDS_ATTRIBUTE {
            return Ok(self.attribute_num());
        }
        self.attributes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| {
                AtlasError::NotFound(format!(
                    "attribute '{}' in array '{}'",
                    name, self.name
                ))
            })
    }

    /// Name of attribute `idx` (the coordinates for `attribute_num()`)
    pub fn attribute_name(&self, idx: usize) -> &str {
        match self.attributes.get(idx) {
            Some(a) => &a.name,
            None => COORDS_ATTRIBUTE,
        }
    }

    /// Buffer layout of attribute `idx` (the coordinates for `attribute_num()`)
    pub fn attribute_layout(&self, idx: usize) -> AttributeLayout {
        match self.attributes.get(idx) {
            Some(a) => AttributeLayout {
                datatype: a.datatype,
                cell_val_num: a.cell_val_num,
            },
            None => AttributeLayout {
                datatype: self.coords_type(),
                cell_val_num: CellValNum::Fixed(self.dim_num() as u32),
            },
        }
    }

    pub(crate) fn compression_of(&self, idx: usize) -> Compression {
        match self.attributes.get(idx) {
            Some(a) => a.compression,
            None => self.coords_compression,
        }
    }

    /// Resolve a session attribute list to indexes.
    ///
    /// `None` selects every attribute, followed by the coordinates when
    /// `with_coords` is set.
    pub(crate) fn session_attributes(
        &self,
        names: Option<&[&str]>,
        with_coords: bool,
    ) -> Result<Vec<usize>> {
        let Some(names) = names else {
            let mut all: Vec<usize> = (0..self.attribute_num()).collect();
            if with_coords {
                all.push(self.attribute_num());
            }
            return Ok(all);
        };
        if names.is_empty() {
            return Err(AtlasError::InvalidInput(
                "attribute list is empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let idx = self.attribute_index(name)?;
            if !seen.insert(idx) {
                return Err(AtlasError::InvalidInput(format!(
                    "attribute '{}' listed twice",
                    name
                )));
            }
            out.push(idx);
        }
        Ok(out)
    }

    // =========================================================================
    // Coordinates
    // =========================================================================

    /// Decode packed coordinate tuples into sort keys, checking each against
    /// the domain
    pub(crate) fn decode_coords(&self, bytes: &[u8]) -> Result<Vec<Vec<u64>>> {
        let datatype = self.coords_type();
        let size = datatype.size();
        let tuple = self.coords_size();
        if bytes.len() % tuple != 0 {
            return Err(AtlasError::SchemaMismatch(format!(
                "coordinates buffer of {} bytes is not a multiple of {}",
                bytes.len(),
                tuple
            )));
        }

        let domain = self.domain_box();
        let mut cells = Vec::with_capacity(bytes.len() / tuple);
        for chunk in bytes.chunks_exact(tuple) {
            let key: Vec<u64> = chunk
                .chunks_exact(size)
                .map(|v| datatype.sort_key(v))
                .collect();
            if key.iter().any(|k| is_nan_key(datatype, *k)) {
                return Err(AtlasError::InvalidInput(
                    "coordinate is NaN".to_string(),
                ));
            }
            if !key_in_box(&key, &domain) {
                return Err(AtlasError::InvalidInput(format!(
                    "coordinates {:?} outside the domain of '{}'",
                    self.key_values(&key),
                    self.name
                )));
            }
            cells.push(key);
        }
        Ok(cells)
    }

    /// Append the packed coordinates of one key tuple
    pub(crate) fn encode_coords(&self, key: &[u64], out: &mut Vec<u8>) {
        let datatype = self.coords_type();
        for k in key {
            datatype.write_key(*k, out);
        }
    }

    /// Domain as a key box
    pub(crate) fn domain_box(&self) -> KeyBox {
        self.domain.key_box()
    }

    /// Validate a subarray against the domain and convert it to a key box
    pub(crate) fn subarray_box(&self, subarray: &Domain) -> Result<KeyBox> {
        if subarray.datatype() != self.coords_type() {
            return Err(AtlasError::InvalidInput(format!(
                "subarray type {:?} differs from coordinate type {:?}",
                subarray.datatype(),
                self.coords_type()
            )));
        }
        if subarray.dim_num() != self.dim_num() {
            return Err(AtlasError::InvalidInput(format!(
                "subarray has {} ranges for {} dimensions",
                subarray.dim_num(),
                self.dim_num()
            )));
        }
        subarray
            .check()
            .map_err(|msg| AtlasError::InvalidInput(format!("invalid subarray: {}", msg)))?;

        let bx = subarray.key_box();
        let domain = self.domain_box();
        let inside = bx
            .iter()
            .zip(domain.iter())
            .all(|((lo, hi), (dlo, dhi))| lo >= dlo && hi <= dhi);
        if !inside {
            return Err(AtlasError::InvalidInput(format!(
                "subarray {:?} exceeds the domain of '{}'",
                subarray, self.name
            )));
        }
        Ok(bx)
    }

    /// Coordinate values behind a key, for messages
    fn key_values(&self, key: &[u64]) -> Vec<f64> {
        key.iter().map(|k| self.coords_type().key_to_f64(*k)).collect()
    }
}

// =============================================================================
// Validation Helpers
// =============================================================================

fn check_name(name: &str, allow_reserved: bool) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("attribute and dimension names must not be empty".to_string());
    }
    if name.contains('/') || name.contains('\\') {
        return Err(format!("name '{}' contains a path separator", name));
    }
    if !allow_reserved && name.starts_with(RESERVED_PREFIX) {
        return Err(format!(
            "name '{}' uses the reserved prefix '{}'",
            name, RESERVED_PREFIX
        ));
    }
    Ok(())
}

fn check_extents(domain: &Domain, extents: &TileExtents) -> std::result::Result<(), String> {
    if extents.datatype() != domain.datatype() {
        return Err(format!(
            "tile extent type {:?} differs from domain type {:?}",
            extents.datatype(),
            domain.datatype()
        ));
    }
    if extents.len() != domain.dim_num() {
        return Err(format!(
            "{} tile extents for {} dimensions",
            extents.len(),
            domain.dim_num()
        ));
    }

    match (domain.int_ranges(), extents.as_i64()) {
        (Some(ranges), Some(ext)) => {
            for (d, ((lo, hi), e)) in ranges.iter().zip(ext.iter()).enumerate() {
                let span = *hi as i128 - *lo as i128 + 1;
                if *e <= 0 || *e as i128 > span {
                    return Err(format!(
                        "tile extent {} of dimension {} must lie in [1, {}]",
                        e, d, span
                    ));
                }
            }
        }
        _ => {
            for (d, ((lo, hi), e)) in domain
                .f64_ranges()
                .iter()
                .zip(extents.as_f64().iter())
                .enumerate()
            {
                let span = hi - lo;
                if !(e.is_finite() && *e > 0.0) || (span > 0.0 && *e > span) {
                    return Err(format!(
                        "tile extent {} of dimension {} must be positive and at most {}",
                        e, d, span
                    ));
                }
            }
        }
    }
    Ok(())
}

fn is_nan_key(datatype: Datatype, key: u64) -> bool {
    match datatype {
        Datatype::Float32 | Datatype::Float64 => datatype.key_to_f64(key).is_nan(),
        _ => false,
    }
}
