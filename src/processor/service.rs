//! Service description and GETINFO replies.

use crate::error::Result;
use crate::packers::{ids, HeteroMap, Value};
use crate::protocol::info;

/// Protocol version announced in META info.
pub const PROTOCOL_VERSION: &str = "AGNOS-1.0";

/// Toolchain version announced in META info.
pub const TOOLCHAIN_VERSION: &str = "1.0.0";

/// Implementation name announced in META info.
pub const IMPLEMENTATION: &str = "objwire";

/// Reflection entry for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub id: i32,
    pub name: String,
    /// IDL return type, `"void"` for none.
    pub return_type: String,
    /// Argument names and IDL types, in call order.
    pub args: Vec<(String, String)>,
    pub annotations: Vec<(String, String)>,
}

impl FunctionInfo {
    pub fn new(id: i32, name: impl Into<String>, return_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            return_type: return_type.into(),
            args: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, idl_type: impl Into<String>) -> Self {
        self.args.push((name.into(), idl_type.into()));
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.push((key.into(), value.into()));
        self
    }
}

/// What a processor knows about the service it serves.
#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Digest of the IDL the service was generated from.
    pub idl_magic: String,
    /// Client versions the service accepts.
    pub supported_versions: Vec<String>,
    pub functions: Vec<FunctionInfo>,
    /// Pre-built REFLECTION reply. Derived from `functions` when absent.
    pub reflection: Option<HeteroMap>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, idl_magic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            idl_magic: idl_magic.into(),
            ..Self::default()
        }
    }

    pub fn supported_version(mut self, version: impl Into<String>) -> Self {
        self.supported_versions.push(version.into());
        self
    }

    pub fn function(mut self, info: FunctionInfo) -> Self {
        self.functions.push(info);
        self
    }

    pub fn reflection(mut self, map: HeteroMap) -> Self {
        self.reflection = Some(map);
        self
    }

    /// GETINFO reply for `code`. Unknown codes get META.
    pub fn info(&self, code: i32, compression_supported: bool) -> Result<HeteroMap> {
        match code {
            info::SERVICE => self.service_info(),
            info::FUNCTIONS => self.functions_info(),
            info::REFLECTION => self.reflection_info(),
            _ => meta_info(compression_supported),
        }
    }

    pub fn service_info(&self) -> Result<HeteroMap> {
        let mut map = HeteroMap::new();
        map.insert("SERVICE_NAME", self.name.as_str())?;
        map.insert("IDL_MAGIC", self.idl_magic.as_str())?;
        map.add(
            "SUPPORTED_VERSIONS",
            ids::STR,
            string_list(&self.supported_versions),
            ids::LIST_OF_STR,
        );
        Ok(map)
    }

    pub fn functions_info(&self) -> Result<HeteroMap> {
        let mut map = HeteroMap::new();
        for func in &self.functions {
            let entry = map.new_map(func.id)?;
            entry.insert("name", func.name.as_str())?;
            entry.insert("type", func.return_type.as_str())?;
            entry.add("args", ids::STR, string_pairs(&func.args), ids::MAP_OF_STR_STR);
            if !func.annotations.is_empty() {
                entry.add(
                    "annotations",
                    ids::STR,
                    string_pairs(&func.annotations),
                    ids::MAP_OF_STR_STR,
                );
            }
        }
        Ok(map)
    }

    pub fn reflection_info(&self) -> Result<HeteroMap> {
        if let Some(map) = &self.reflection {
            return Ok(map.clone());
        }

        let mut map = HeteroMap::new();
        let group = map.new_map("functions")?;
        for func in &self.functions {
            let entry = group.new_map(func.name.as_str())?;
            entry.insert("type", func.return_type.as_str())?;
            let (names, types): (Vec<String>, Vec<String>) = func.args.iter().cloned().unzip();
            entry.add("arg_names", ids::STR, string_list(&names), ids::LIST_OF_STR);
            entry.add("arg_types", ids::STR, string_list(&types), ids::LIST_OF_STR);
        }
        Ok(map)
    }
}

/// META info: versions, compression support and the other info codes.
pub fn meta_info(compression_supported: bool) -> Result<HeteroMap> {
    let mut map = HeteroMap::new();
    map.insert("AGNOS_PROTOCOL_VERSION", PROTOCOL_VERSION)?;
    map.insert("AGNOS_TOOLCHAIN_VERSION", TOOLCHAIN_VERSION)?;
    map.insert("COMPRESSION_SUPPORTED", compression_supported)?;
    map.insert("IMPLEMENTATION", IMPLEMENTATION)?;

    let codes = [
        ("INFO_META", info::META),
        ("INFO_SERVICE", info::SERVICE),
        ("INFO_FUNCTIONS", info::FUNCTIONS),
        ("INFO_REFLECTION", info::REFLECTION),
    ];
    let codes = codes
        .iter()
        .map(|(name, code)| (Value::from(*name), Value::Int32(*code)))
        .collect();
    map.add("INFO_CODES", ids::STR, Value::Map(codes), ids::MAP_OF_STR_INT32);
    Ok(map)
}

fn string_list(items: &[String]) -> Value {
    Value::List(items.iter().map(|s| Value::from(s.as_str())).collect())
}

fn string_pairs(pairs: &[(String, String)]) -> Value {
    Value::Map(
        pairs
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
            .collect(),
    )
}
