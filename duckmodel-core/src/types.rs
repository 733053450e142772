//! Type bridge between DuckDB SQL type strings and the canonical type system.
//!
//! Scalar names map through a fixed table. Composite types (`T[]`, `T[N]`,
//! `DECIMAL(p,s)`, `STRUCT(...)`, `MAP(K, V)`) are parsed recursively. A type
//! string that cannot be mapped is an error, never coerced.

use std::fmt;

use arrow_schema::{DataType, TimeUnit};

use crate::error::{DriverError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalType {
    pub kind: TypeKind,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Unspecified,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    String,
    Bytes,
    Date,
    Time,
    Timestamp,
    Interval,
    Decimal { precision: u8, scale: u8 },
    Uuid,
    Json,
    Array(Box<CanonicalType>),
    Struct(StructType),
    Map(Box<MapType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructType {
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    pub name: String,
    pub data_type: CanonicalType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapType {
    pub key: CanonicalType,
    pub value: CanonicalType,
}

impl CanonicalType {
    pub fn new(kind: TypeKind, nullable: bool) -> Self {
        Self { kind, nullable }
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match canonical_to_native(self) {
            Ok(native) => f.write_str(&native),
            Err(_) => f.write_str("UNSPECIFIED"),
        }
    }
}

/// Map a DuckDB type string (as reported by `information_schema` or
/// `DESCRIBE`) to a canonical type.
pub fn native_type_to_canonical(native: &str, nullable: bool) -> Result<CanonicalType> {
    let native = native.trim();
    if native.is_empty() {
        return Err(unsupported(native));
    }

    // T[] and T[N]
    if native.ends_with(']') {
        if let Some(open) = native.rfind('[') {
            let size = &native[open + 1..native.len() - 1];
            if size.chars().all(|c| c.is_ascii_digit()) {
                let elem = native_type_to_canonical(&native[..open], true)?;
                return Ok(CanonicalType::new(TypeKind::Array(Box::new(elem)), nullable));
            }
        }
        return Err(unsupported(native));
    }

    if native.contains('(') {
        return composite_to_canonical(native, nullable);
    }

    let kind = match native.to_uppercase().as_str() {
        "BOOLEAN" | "BOOL" => TypeKind::Bool,
        "TINYINT" | "INT1" => TypeKind::Int8,
        "SMALLINT" | "INT2" => TypeKind::Int16,
        "INTEGER" | "INT" | "INT4" => TypeKind::Int32,
        "BIGINT" | "INT8" => TypeKind::Int64,
        "HUGEINT" => TypeKind::Int128,
        "UTINYINT" => TypeKind::Uint8,
        "USMALLINT" => TypeKind::Uint16,
        "UINTEGER" => TypeKind::Uint32,
        "UBIGINT" => TypeKind::Uint64,
        "FLOAT" | "REAL" | "FLOAT4" => TypeKind::Float32,
        "DOUBLE" | "FLOAT8" => TypeKind::Float64,
        "TIMESTAMP" | "DATETIME" | "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" | "TIMESTAMP_S"
        | "TIMESTAMP_MS" | "TIMESTAMP_NS" => TypeKind::Timestamp,
        "DATE" => TypeKind::Date,
        "TIME" | "TIMETZ" | "TIME WITH TIME ZONE" => TypeKind::Time,
        "INTERVAL" => TypeKind::Interval,
        "VARCHAR" | "CHAR" | "BPCHAR" | "TEXT" | "STRING" | "ENUM" => TypeKind::String,
        "BLOB" | "BYTEA" => TypeKind::Bytes,
        "UUID" => TypeKind::Uuid,
        "JSON" => TypeKind::Json,
        "DECIMAL" | "NUMERIC" => TypeKind::Decimal {
            precision: 18,
            scale: 3,
        },
        "NULL" => TypeKind::Unspecified,
        _ => return Err(unsupported(native)),
    };
    Ok(CanonicalType::new(kind, nullable))
}

fn composite_to_canonical(native: &str, nullable: bool) -> Result<CanonicalType> {
    let (base, args) = split_base_and_args(native).ok_or_else(|| unsupported(native))?;
    let kind = match base.to_uppercase().as_str() {
        "DECIMAL" | "NUMERIC" => {
            let parts = split_top_level(args);
            let precision = parts
                .first()
                .and_then(|p| p.trim().parse::<u8>().ok())
                .ok_or_else(|| unsupported(native))?;
            let scale = match parts.get(1) {
                Some(s) => s.trim().parse::<u8>().map_err(|_| unsupported(native))?,
                None => 0,
            };
            if parts.len() > 2 || scale > precision {
                return Err(unsupported(native));
            }
            TypeKind::Decimal { precision, scale }
        }
        "STRUCT" => {
            let mut fields = Vec::new();
            for part in split_top_level(args) {
                let (name, type_str) = split_struct_field(part).ok_or_else(|| unsupported(native))?;
                fields.push(StructField {
                    name,
                    data_type: native_type_to_canonical(type_str, true)?,
                });
            }
            TypeKind::Struct(StructType { fields })
        }
        "MAP" => {
            let parts = split_top_level(args);
            if parts.len() != 2 {
                return Err(unsupported(native));
            }
            TypeKind::Map(Box::new(MapType {
                key: native_type_to_canonical(parts[0], true)?,
                value: native_type_to_canonical(parts[1], true)?,
            }))
        }
        "ENUM" | "VARCHAR" | "CHAR" | "BPCHAR" => TypeKind::String,
        _ => return Err(unsupported(native)),
    };
    Ok(CanonicalType::new(kind, nullable))
}

/// `BASE(args)` into `("BASE", "args")`. The argument string runs from the
/// first `(` to the final `)`.
fn split_base_and_args(native: &str) -> Option<(&str, &str)> {
    let open = native.find('(')?;
    if !native.ends_with(')') || open + 1 > native.len() - 1 {
        return None;
    }
    Some((native[..open].trim(), &native[open + 1..native.len() - 1]))
}

/// Split on commas that are neither inside a nested parenthesis nor inside a
/// double-quoted identifier. Leading whitespace of each part is dropped.
fn split_top_level(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0usize;
    for (idx, ch) in args.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                parts.push(args[start..idx].trim_start());
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = args[start..].trim_start();
    if !tail.is_empty() || !parts.is_empty() {
        parts.push(tail);
    }
    parts
}

/// Split a struct field like `name TYPE` or `"quoted ""name""" TYPE`.
fn split_struct_field(field: &str) -> Option<(String, &str)> {
    let field = field.trim();
    if let Some(rest) = field.strip_prefix('"') {
        let mut name = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((idx, ch)) = chars.next() {
            if ch == '"' {
                if matches!(chars.peek(), Some((_, '"'))) {
                    name.push('"');
                    chars.next();
                    continue;
                }
                let type_str = rest[idx + 1..].trim();
                if type_str.is_empty() {
                    return None;
                }
                return Some((name, type_str));
            }
            name.push(ch);
        }
        return None;
    }
    let (name, type_str) = field.split_once(' ')?;
    let type_str = type_str.trim();
    if name.is_empty() || type_str.is_empty() {
        return None;
    }
    Some((name.to_string(), type_str))
}

fn unsupported(native: &str) -> DriverError {
    DriverError::UnsupportedType(format!("DuckDB type {native:?}"))
}

/// Render a canonical type as a DuckDB type string.
pub fn canonical_to_native(ty: &CanonicalType) -> Result<String> {
    let native = match &ty.kind {
        TypeKind::Unspecified => {
            return Err(DriverError::UnsupportedType(
                "cannot render an unspecified type".to_string(),
            ))
        }
        TypeKind::Bool => "BOOLEAN".to_string(),
        TypeKind::Int8 => "TINYINT".to_string(),
        TypeKind::Int16 => "SMALLINT".to_string(),
        TypeKind::Int32 => "INTEGER".to_string(),
        TypeKind::Int64 => "BIGINT".to_string(),
        TypeKind::Int128 => "HUGEINT".to_string(),
        TypeKind::Uint8 => "UTINYINT".to_string(),
        TypeKind::Uint16 => "USMALLINT".to_string(),
        TypeKind::Uint32 => "UINTEGER".to_string(),
        TypeKind::Uint64 => "UBIGINT".to_string(),
        TypeKind::Float32 => "FLOAT".to_string(),
        TypeKind::Float64 => "DOUBLE".to_string(),
        TypeKind::String => "VARCHAR".to_string(),
        TypeKind::Bytes => "BLOB".to_string(),
        TypeKind::Date => "DATE".to_string(),
        TypeKind::Time => "TIME".to_string(),
        TypeKind::Timestamp => "TIMESTAMP".to_string(),
        TypeKind::Interval => "INTERVAL".to_string(),
        TypeKind::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
        TypeKind::Uuid => "UUID".to_string(),
        TypeKind::Json => "JSON".to_string(),
        TypeKind::Array(elem) => format!("{}[]", canonical_to_native(elem)?),
        TypeKind::Struct(st) => {
            let fields = st
                .fields
                .iter()
                .map(|f| {
                    Ok(format!(
                        "{} {}",
                        crate::sql::safe_name(&f.name),
                        canonical_to_native(&f.data_type)?
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            format!("STRUCT({})", fields.join(", "))
        }
        TypeKind::Map(map) => format!(
            "MAP({}, {})",
            canonical_to_native(&map.key)?,
            canonical_to_native(&map.value)?
        ),
    };
    Ok(native)
}

/// DuckDB column type for an Arrow data type, used when creating a table that
/// receives Arrow batches through the appender.
pub fn arrow_type_to_native(data_type: &DataType) -> Result<String> {
    let native = match data_type {
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Int8 => "TINYINT".to_string(),
        DataType::Int16 => "SMALLINT".to_string(),
        DataType::Int32 => "INTEGER".to_string(),
        DataType::Int64 => "BIGINT".to_string(),
        DataType::UInt8 => "UTINYINT".to_string(),
        DataType::UInt16 => "USMALLINT".to_string(),
        DataType::UInt32 => "UINTEGER".to_string(),
        DataType::UInt64 => "UBIGINT".to_string(),
        DataType::Float16 | DataType::Float32 => "FLOAT".to_string(),
        DataType::Float64 => "DOUBLE".to_string(),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "VARCHAR".to_string(),
        DataType::Binary | DataType::LargeBinary | DataType::BinaryView => "BLOB".to_string(),
        DataType::FixedSizeBinary(_) => "BLOB".to_string(),
        DataType::Date32 | DataType::Date64 => "DATE".to_string(),
        DataType::Time32(_) | DataType::Time64(_) => "TIME".to_string(),
        DataType::Timestamp(unit, None) => match unit {
            TimeUnit::Second => "TIMESTAMP_S".to_string(),
            TimeUnit::Millisecond => "TIMESTAMP_MS".to_string(),
            TimeUnit::Microsecond => "TIMESTAMP".to_string(),
            TimeUnit::Nanosecond => "TIMESTAMP_NS".to_string(),
        },
        DataType::Timestamp(_, Some(_)) => "TIMESTAMPTZ".to_string(),
        DataType::Interval(_) | DataType::Duration(_) => "INTERVAL".to_string(),
        DataType::Decimal128(precision, scale) if *scale >= 0 && *precision <= 38 => {
            format!("DECIMAL({precision},{scale})")
        }
        DataType::List(field) | DataType::LargeList(field) => {
            format!("{}[]", arrow_type_to_native(field.data_type())?)
        }
        DataType::FixedSizeList(field, size) => {
            format!("{}[{size}]", arrow_type_to_native(field.data_type())?)
        }
        DataType::Struct(fields) => {
            let columns = fields
                .iter()
                .map(|f| {
                    Ok(format!(
                        "{} {}",
                        crate::sql::safe_name(f.name()),
                        arrow_type_to_native(f.data_type())?
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            format!("STRUCT({})", columns.join(", "))
        }
        DataType::Map(entries, _) => match entries.data_type() {
            DataType::Struct(kv) if kv.len() == 2 => format!(
                "MAP({}, {})",
                arrow_type_to_native(kv[0].data_type())?,
                arrow_type_to_native(kv[1].data_type())?
            ),
            other => {
                return Err(DriverError::UnsupportedType(format!(
                    "Arrow map entries type {other}"
                )))
            }
        },
        DataType::Null => "INTEGER".to_string(),
        other => {
            return Err(DriverError::UnsupportedType(format!(
                "Arrow type {other}"
            )))
        }
    };
    Ok(native)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(native: &str) -> CanonicalType {
        native_type_to_canonical(native, true).unwrap()
    }

    fn nn(kind: TypeKind) -> CanonicalType {
        CanonicalType::new(kind, true)
    }

    #[test]
    fn scalar_mappings() {
        assert_eq!(canonical("INTEGER").kind, TypeKind::Int32);
        assert_eq!(canonical("hugeint").kind, TypeKind::Int128);
        assert_eq!(canonical("UBIGINT").kind, TypeKind::Uint64);
        assert_eq!(canonical("VARCHAR").kind, TypeKind::String);
        assert_eq!(canonical("BLOB").kind, TypeKind::Bytes);
        assert_eq!(canonical("NULL").kind, TypeKind::Unspecified);
        assert!(!native_type_to_canonical("BOOLEAN", false).unwrap().nullable);
    }

    #[test]
    fn timestamp_precisions_collapse() {
        for native in [
            "TIMESTAMP",
            "TIMESTAMPTZ",
            "TIMESTAMP WITH TIME ZONE",
            "TIMESTAMP_S",
            "TIMESTAMP_MS",
            "TIMESTAMP_NS",
        ] {
            assert_eq!(canonical(native).kind, TypeKind::Timestamp, "{native}");
        }
        assert_eq!(canonical("TIMETZ").kind, TypeKind::Time);
    }

    #[test]
    fn decimal_precision_and_scale() {
        assert_eq!(
            canonical("DECIMAL(20,2)").kind,
            TypeKind::Decimal {
                precision: 20,
                scale: 2
            }
        );
        assert_eq!(
            canonical("DECIMAL(10)").kind,
            TypeKind::Decimal {
                precision: 10,
                scale: 0
            }
        );
        assert!(native_type_to_canonical("DECIMAL(2,5)", true).is_err());
    }

    #[test]
    fn arrays_and_fixed_size_arrays() {
        assert_eq!(
            canonical("INTEGER[]").kind,
            TypeKind::Array(Box::new(nn(TypeKind::Int32)))
        );
        assert_eq!(
            canonical("VARCHAR[][]").kind,
            TypeKind::Array(Box::new(nn(TypeKind::Array(Box::new(nn(
                TypeKind::String
            ))))))
        );
        assert_eq!(
            canonical("DOUBLE[3]").kind,
            TypeKind::Array(Box::new(nn(TypeKind::Float64)))
        );
    }

    #[test]
    fn struct_with_nested_map() {
        let ty = canonical("STRUCT(a INTEGER, b MAP(INTEGER, BOOLEAN))");
        let TypeKind::Struct(st) = ty.kind else {
            panic!("expected struct");
        };
        assert_eq!(st.fields.len(), 2);
        assert_eq!(st.fields[0].name, "a");
        assert_eq!(st.fields[0].data_type.kind, TypeKind::Int32);
        assert_eq!(st.fields[1].name, "b");
        assert_eq!(
            st.fields[1].data_type.kind,
            TypeKind::Map(Box::new(MapType {
                key: nn(TypeKind::Int32),
                value: nn(TypeKind::Bool),
            }))
        );
    }

    #[test]
    fn struct_fields_with_quoted_names() {
        let ty = canonical(r#"STRUCT("my field" DECIMAL(10,2), "a,b(c)" VARCHAR, "say ""hi""" INTEGER[])"#);
        let TypeKind::Struct(st) = ty.kind else {
            panic!("expected struct");
        };
        let names: Vec<_> = st.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["my field", "a,b(c)", "say \"hi\""]);
        assert_eq!(
            st.fields[0].data_type.kind,
            TypeKind::Decimal {
                precision: 10,
                scale: 2
            }
        );
        assert_eq!(
            st.fields[2].data_type.kind,
            TypeKind::Array(Box::new(nn(TypeKind::Int32)))
        );
    }

    #[test]
    fn nested_struct_in_list_and_map_values() {
        let ty = canonical("MAP(VARCHAR, STRUCT(x STRUCT(y DOUBLE, z DECIMAL(4,1)), w VARCHAR[]))[]");
        let TypeKind::Array(elem) = ty.kind else {
            panic!("expected array");
        };
        let TypeKind::Map(map) = elem.kind else {
            panic!("expected map");
        };
        assert_eq!(map.key.kind, TypeKind::String);
        let TypeKind::Struct(value) = &map.value.kind else {
            panic!("expected struct value");
        };
        assert_eq!(value.fields.len(), 2);
        let TypeKind::Struct(inner) = &value.fields[0].data_type.kind else {
            panic!("expected nested struct");
        };
        assert_eq!(inner.fields[1].name, "z");
    }

    #[test]
    fn enums_are_strings() {
        assert_eq!(canonical("ENUM('a', 'b,c')").kind, TypeKind::String);
    }

    #[test]
    fn unknown_types_fail() {
        let err = native_type_to_canonical("INVALID", true).unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedType(_)), "{err}");
        assert!(err.to_string().contains("INVALID"));
        assert!(matches!(
            arrow_type_to_native(&DataType::Decimal256(60, 2)),
            Err(DriverError::UnsupportedType(_))
        ));
        assert!(native_type_to_canonical("UNION(a INTEGER, b VARCHAR)", true).is_err());
        assert!(native_type_to_canonical("MAP(INTEGER)", true).is_err());
        assert!(native_type_to_canonical("STRUCT(a)", true).is_err());
        assert!(native_type_to_canonical("", true).is_err());
    }

    #[test]
    fn canonical_renders_back_to_native() {
        let ty = canonical(r#"STRUCT("my field" DECIMAL(10,2), b MAP(INTEGER, BOOLEAN)[])"#);
        assert_eq!(
            canonical_to_native(&ty).unwrap(),
            r#"STRUCT("my field" DECIMAL(10,2), "b" MAP(INTEGER, BOOLEAN)[])"#
        );
    }

    #[test]
    fn arrow_types_to_native() {
        assert_eq!(arrow_type_to_native(&DataType::Int64).unwrap(), "BIGINT");
        assert_eq!(
            arrow_type_to_native(&DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())))
                .unwrap(),
            "TIMESTAMPTZ"
        );
        assert_eq!(
            arrow_type_to_native(&DataType::Decimal128(12, 4)).unwrap(),
            "DECIMAL(12,4)"
        );
        let list = DataType::List(std::sync::Arc::new(arrow_schema::Field::new(
            "item",
            DataType::Utf8,
            true,
        )));
        assert_eq!(arrow_type_to_native(&list).unwrap(), "VARCHAR[]");
    }
}
