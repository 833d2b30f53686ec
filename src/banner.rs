//! Device banner (the `CNXN` payload) and feature names.

use serde::{Deserialize, Serialize};

/// Feature names exchanged in the `CNXN` banners.
pub mod feature {
    pub const SHELL_V2: &str = "shell_v2";
    pub const CMD: &str = "cmd";
    pub const STAT_V2: &str = "stat_v2";
    pub const LS_V2: &str = "ls_v2";
    pub const FIXED_PUSH_MKDIR: &str = "fixed_push_mkdir";
    pub const APEX: &str = "apex";
    pub const ABB: &str = "abb";
    pub const FIXED_PUSH_SYMLINK_TIMESTAMP: &str = "fixed_push_symlink_timestamp";
    pub const ABB_EXEC: &str = "abb_exec";
    pub const REMOUNT_SHELL: &str = "remount_shell";
    pub const TRACK_APP: &str = "track_app";
    pub const SENDRECV_V2: &str = "sendrecv_v2";
    pub const SENDRECV_V2_BROTLI: &str = "sendrecv_v2_brotli";
    pub const SENDRECV_V2_LZ4: &str = "sendrecv_v2_lz4";
    pub const SENDRECV_V2_ZSTD: &str = "sendrecv_v2_zstd";
    pub const SENDRECV_V2_DRY_RUN_SEND: &str = "sendrecv_v2_dry_run_send";
    pub const DELAYED_ACK: &str = "delayed_ack";

    /// Everything this host understands, offered by default.
    pub const DEFAULT: &[&str] = &[
        SHELL_V2,
        CMD,
        STAT_V2,
        LS_V2,
        FIXED_PUSH_MKDIR,
        APEX,
        ABB,
        FIXED_PUSH_SYMLINK_TIMESTAMP,
        ABB_EXEC,
        REMOUNT_SHELL,
        TRACK_APP,
        SENDRECV_V2,
        SENDRECV_V2_BROTLI,
        SENDRECV_V2_LZ4,
        SENDRECV_V2_ZSTD,
        SENDRECV_V2_DRY_RUN_SEND,
        DELAYED_ACK,
    ];
}

/// Parsed device banner.
///
/// Format: `<state>::<key>=<value>;<key>=<value>;...`, e.g.
/// `device::ro.product.name=foo;ro.product.model=Pixel;ro.product.device=bar;features=shell_v2,cmd`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdbBanner {
    pub state: String,
    pub product: Option<String>,
    pub model: Option<String>,
    pub device: Option<String>,
    pub features: Vec<String>,
}

impl AdbBanner {
    /// Parse leniently: unknown keys and malformed pairs are skipped.
    pub fn parse(banner: &str) -> Self {
        let banner = banner.trim_end_matches('\0');
        let (state, props) = banner.split_once("::").unwrap_or((banner, ""));

        let mut parsed = AdbBanner {
            state: state.to_string(),
            ..Default::default()
        };

        for pair in props.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "ro.product.name" => parsed.product = Some(value.to_string()),
                "ro.product.model" => parsed.model = Some(value.to_string()),
                "ro.product.device" => parsed.device = Some(value.to_string()),
                "features" => {
                    parsed.features = value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {}
            }
        }

        parsed
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }
}
