use std::io::{Cursor, Write};
use std::path::PathBuf;

use serde_json::{json, Map, Value};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::temp::TestContext;

/// Builder for firmware distribution packages (ZIP + manifest.json).
///
/// The manifest is generated from the added components unless
/// [`PackageBuilder::raw_manifest`] replaces it. A package with neither has
/// no manifest at all.
pub struct PackageBuilder {
    manifest: Map<String, Value>,
    raw_manifest: Option<String>,
    files: Vec<(String, Vec<u8>)>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self {
            manifest: Map::new(),
            raw_manifest: None,
            files: Vec::new(),
        }
    }

    fn component(mut self, key: &str, bin: &[u8], dat: Option<&[u8]>, extra: Value) -> Self {
        let bin_name = format!("{}.bin", key);
        let mut entry = json!({ "bin_file": bin_name });
        self.files.push((bin_name, bin.to_vec()));

        if let Some(dat) = dat {
            let dat_name = format!("{}.dat", key);
            entry["dat_file"] = Value::String(dat_name.clone());
            self.files.push((dat_name, dat.to_vec()));
        }
        if let (Value::Object(entry), Value::Object(extra)) = (&mut entry, extra) {
            entry.extend(extra);
        }
        self.manifest.insert(key.to_string(), entry);
        self
    }

    pub fn application(self, bin: &[u8], dat: Option<&[u8]>) -> Self {
        self.component("application", bin, dat, json!({}))
    }

    pub fn softdevice(self, bin: &[u8], dat: Option<&[u8]>) -> Self {
        self.component("softdevice", bin, dat, json!({}))
    }

    pub fn bootloader(self, bin: &[u8], dat: Option<&[u8]>) -> Self {
        self.component("bootloader", bin, dat, json!({}))
    }

    pub fn softdevice_bootloader(
        self,
        bin: &[u8],
        sd_size: u32,
        bl_size: u32,
        dat: Option<&[u8]>,
    ) -> Self {
        self.component(
            "softdevice_bootloader",
            bin,
            dat,
            json!({ "sd_size": sd_size, "bl_size": bl_size }),
        )
    }

    /// Use `manifest` verbatim as manifest.json.
    pub fn raw_manifest(mut self, manifest: &str) -> Self {
        self.raw_manifest = Some(manifest.to_string());
        self
    }

    /// Add an arbitrary file to the archive.
    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.files.push((name.to_string(), content.to_vec()));
        self
    }

    pub fn build_bytes(self) -> Vec<u8> {
        let manifest = match self.raw_manifest {
            Some(raw) => Some(raw),
            None if !self.manifest.is_empty() => {
                Some(json!({ "manifest": Value::Object(self.manifest) }).to_string())
            }
            None => None,
        };

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);

        if let Some(manifest) = manifest {
            zip.start_file("manifest.json", options).unwrap();
            zip.write_all(manifest.as_bytes()).unwrap();
        }
        for (name, content) in &self.files {
            zip.start_file(name.as_str(), options).unwrap();
            zip.write_all(content).unwrap();
        }

        zip.finish().unwrap().into_inner()
    }

    /// Write the archive into the test context and return its path.
    pub fn write_to(self, ctx: &TestContext, relative_path: &str) -> PathBuf {
        ctx.create_file_bytes(relative_path, &self.build_bytes())
    }
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
