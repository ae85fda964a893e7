use serde::Serialize;
use std::io::Write;

use super::{AttachPoint, FunctionCatalog, FunctionRecord};
use crate::domain::Pid;

/// What an agent needs to start tracing one process
///
/// Written as JSON by `calltrace catalog` and by `calltrace record` before
/// the agents are released. `base_timestamp` is shared by every process of
/// the session so their wire timestamps land on one timeline.
#[derive(Debug, Serialize)]
pub struct CatalogManifest<'a> {
    pub pid: Pid,
    /// Microseconds since the Unix epoch
    pub base_timestamp: u64,
    /// First native id, equal to the number of managed overloads
    pub native_id_offset: usize,
    pub attach: Vec<AttachPoint>,
    pub functions: Vec<&'a FunctionRecord>,
}

impl<'a> CatalogManifest<'a> {
    #[must_use]
    pub fn new(pid: Pid, base_timestamp: u64, catalog: &'a FunctionCatalog) -> Self {
        Self {
            pid,
            base_timestamp,
            native_id_offset: catalog.managed_count(),
            attach: catalog.attach_plan(),
            functions: catalog.iter().collect(),
        }
    }

    /// # Errors
    /// Returns an error if serialization or the write fails
    pub fn write_to<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogBuilder, ManagedMethod, NativeCandidate, NativeFunction};

    #[test]
    fn test_manifest_json_shape() {
        let mut builder = CatalogBuilder::new();
        builder.add_managed([ManagedMethod {
            class: "com.example.View".to_string(),
            method: "draw".to_string(),
            overload: None,
        }]);
        builder.add_native([NativeFunction {
            candidate: NativeCandidate {
                module: "librender.so".to_string(),
                name: "render".to_string(),
                demangled_name: None,
                static_address: 0x1000,
                size: 64,
                source: None,
            },
            runtime_address: 0x7f00_0000_1000,
        }]);
        let catalog = builder.build().unwrap();

        let mut out = Vec::new();
        CatalogManifest::new(Pid(7), 1_700_000_000_000_000, &catalog).write_to(&mut out).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(json["pid"], 7);
        assert_eq!(json["native_id_offset"], 1);
        assert_eq!(json["attach"][0]["id"], 1);
        assert_eq!(json["attach"][0]["runtime_address"], 0x7f00_0000_1000_u64);
        assert_eq!(json["functions"][0]["type"], "managed");
        assert_eq!(json["functions"][0]["name"], "com.example.View.draw");
        assert_eq!(json["functions"][1]["type"], "native");
        assert_eq!(json["functions"][1]["category"], "librender.so");
    }
}
