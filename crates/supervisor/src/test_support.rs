use toolmux_config::PeerConfig;

/// A shell peer that answers `initialize` advertising `$TOOL`, then idles
/// until its input closes.
const SCRIPTED_PEER: &str = r#"read line
id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
printf '{"jsonrpc":"2.0","id":%s,"result":{"peer_name":"scripted","protocol_version":"toolmux/1","tools":[{"name":"%s","input_schema":{"type":"object"}}]}}\n' "$id" "$TOOL"
cat >/dev/null"#;

pub(crate) fn scripted(name: &str, tool: &str) -> PeerConfig {
    PeerConfig::new(name, "sh")
        .with_args(["-c", SCRIPTED_PEER])
        .with_env("TOOL", tool)
}
