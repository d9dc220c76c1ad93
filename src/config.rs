//! `libnfc.conf` / `devices.d/*.conf` parsing (spec §6).
//!
//! Grounded on the teacher's `Setting::load_from_nvs` (`main.rs`): a typed
//! struct populated field-by-field, falling back to a documented default on
//! any parse failure rather than aborting the whole load. Translated from
//! NVS-blob reads to a line-oriented text parser since this crate is
//! host-side, and hand-rolled rather than pulled from a parser-combinator
//! crate, matching the teacher's own hand-rolled `json/reader.rs`.

use std::env;
use std::fs;
use std::path::Path;

/// At most this many user-defined devices across `libnfc.conf` and every
/// `devices.d/*.conf` file combined.
pub const MAX_DEVICES: usize = 16;

#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub name: String,
    pub connstring: Option<String>,
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub allow_autoscan: bool,
    pub allow_intrusive_scan: bool,
    pub log_level: u32,
    pub devices: Vec<DeviceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_autoscan: true,
            allow_intrusive_scan: false,
            log_level: 0,
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Load `libnfc.conf`, then merge every `devices.d/*.conf` found beside
    /// it, then apply `LIBNFC_LOG_LEVEL` if set. Any single file that fails
    /// to read or parse is skipped with its default left in place, the way
    /// the teacher's NVS loader falls back field-by-field rather than
    /// failing the whole settings load.
    pub fn load(conf_dir: &Path) -> Self {
        let mut config = Self::default();

        let main_conf = conf_dir.join("libnfc.conf");
        if let Ok(text) = fs::read_to_string(&main_conf) {
            config.merge_text(&text);
        }

        let devices_dir = conf_dir.join("devices.d");
        if let Ok(entries) = fs::read_dir(&devices_dir) {
            let mut paths: Vec<_> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("conf"))
                .collect();
            paths.sort();
            for path in paths {
                if config.devices.len() >= MAX_DEVICES {
                    break;
                }
                if let Ok(text) = fs::read_to_string(&path) {
                    config.merge_text(&text);
                }
            }
        }

        if let Ok(level) = env::var("LIBNFC_LOG_LEVEL") {
            if let Ok(parsed) = level.parse() {
                config.log_level = parsed;
            }
        }

        config
    }

    fn merge_text(&mut self, text: &str) {
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = unquote(value.trim());

            match key {
                "allow_autoscan" => self.allow_autoscan = parse_bool(&value),
                "allow_intrusive_scan" => self.allow_intrusive_scan = parse_bool(&value),
                "log_level" => {
                    if let Ok(level) = value.parse() {
                        self.log_level = level;
                    }
                }
                "device.name" => {
                    if self.devices.len() < MAX_DEVICES {
                        self.devices.push(DeviceEntry {
                            name: value,
                            connstring: None,
                            optional: false,
                        });
                    }
                }
                "device.connstring" => {
                    if let Some(last) = self.devices.last_mut() {
                        last.connstring = Some(value);
                    }
                }
                "device.optional" => {
                    if let Some(last) = self.devices.last_mut() {
                        last.optional = parse_bool(&value);
                    }
                }
                _ => {}
            }
        }
    }
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn parses_main_conf_and_devices() {
        let dir = std::env::temp_dir()
            .join(format!("pn53x_core_config_test_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::create_dir_all(dir.join("devices.d")).unwrap();

        write_file(
            &dir,
            "libnfc.conf",
            "# comment\nallow_autoscan = false\nlog_level = 2\n",
        );
        write_file(
            &dir.join("devices.d"),
            "acr122.conf",
            "device.name = \"ACR122\"\ndevice.connstring = \"acr122_pcsc:\"\ndevice.optional = true\n",
        );

        let config = Config::load(&dir);
        assert!(!config.allow_autoscan);
        assert_eq!(config.log_level, 2);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].name, "ACR122");
        assert_eq!(config.devices[0].connstring.as_deref(), Some("acr122_pcsc:"));
        assert!(config.devices[0].optional);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn caps_device_count() {
        let mut config = Config::default();
        let mut text = String::new();
        for i in 0..(MAX_DEVICES + 5) {
            text.push_str(&format!("device.name = dev{i}\n"));
        }
        config.merge_text(&text);
        assert_eq!(config.devices.len(), MAX_DEVICES);
    }
}
