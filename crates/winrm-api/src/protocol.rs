//! WS-Management SOAP envelope construction and response parsing.
//!
//! Envelopes are built from named-placeholder templates over typed
//! fields; responses are parsed with quick-xml by local element name,
//! since servers vary in namespace prefixes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::events::Event;

pub const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
pub const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
pub const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
pub const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
pub const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const RESOURCE_CMD_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// Fault subcode the server returns when an operation outlives its
/// `OperationTimeout`. Receive loops treat it as "nothing yet", not an error.
const WSMAN_TIMEOUT_CODE: &str = "2150858793";

/// Build a complete SOAP envelope for `action` against the cmd shell
/// resource. `selector` carries the shell id for per-shell operations.
pub fn envelope(
    endpoint: &str,
    action: &str,
    selector: Option<&str>,
    options: &str,
    body: &str,
    timeout_secs: u64,
) -> String {
    let message_id = uuid::Uuid::new_v4();
    let selector_set = match selector {
        Some(shell_id) => format!(
            "<w:SelectorSet><w:Selector Name=\"ShellId\">{shell_id}</w:Selector></w:SelectorSet>"
        ),
        None => String::new(),
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
  <env:Header>
    <a:To>{endpoint}</a:To>
    <a:ReplyTo>
      <a:Address mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <w:MaxEnvelopeSize mustUnderstand="true">153600</w:MaxEnvelopeSize>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:OperationTimeout>PT{timeout_secs}S</w:OperationTimeout>
    <w:ResourceURI mustUnderstand="true">{RESOURCE_CMD_SHELL}</w:ResourceURI>
    <a:Action mustUnderstand="true">{action}</a:Action>
    {selector_set}{options}
  </env:Header>
  <env:Body>{body}</env:Body>
</env:Envelope>"#
    )
}

pub fn create_shell_options() -> String {
    concat!(
        "<w:OptionSet>",
        "<w:Option Name=\"WINRS_NOPROFILE\">FALSE</w:Option>",
        "<w:Option Name=\"WINRS_CODEPAGE\">65001</w:Option>",
        "</w:OptionSet>"
    )
    .to_string()
}

pub fn command_options() -> String {
    concat!(
        "<w:OptionSet>",
        "<w:Option Name=\"WINRS_CONSOLEMODE_STDIN\">TRUE</w:Option>",
        "<w:Option Name=\"WINRS_SKIP_CMD_SHELL\">FALSE</w:Option>",
        "</w:OptionSet>"
    )
    .to_string()
}

pub fn create_shell_body() -> String {
    concat!(
        "<rsp:Shell>",
        "<rsp:InputStreams>stdin</rsp:InputStreams>",
        "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
        "</rsp:Shell>"
    )
    .to_string()
}

pub fn command_body(command: &str) -> String {
    let escaped = quick_xml::escape::escape(command);
    format!("<rsp:CommandLine><rsp:Command>{escaped}</rsp:Command></rsp:CommandLine>")
}

pub fn receive_body(command_id: &str) -> String {
    format!(
        "<rsp:Receive><rsp:DesiredStream CommandId=\"{command_id}\">stdout stderr</rsp:DesiredStream></rsp:Receive>"
    )
}

pub fn signal_terminate_body(command_id: &str) -> String {
    format!(
        "<rsp:Signal CommandId=\"{command_id}\"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"
    )
}

/// Decoded chunk of a Receive response.
#[derive(Debug, Default)]
pub struct ReceiveOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub done: bool,
    pub exit_code: Option<i32>,
}

/// True if the response body is the WS-Man operation-timeout fault,
/// which a Receive long-poll treats as "no output yet".
pub fn is_timeout_fault(body: &str) -> bool {
    body.contains(WSMAN_TIMEOUT_CODE)
}

/// Extract the shell id from a Create response.
///
/// Matches either the `<rsp:ShellId>` body element or the
/// `<w:Selector Name="ShellId">` form in the created-reference header.
pub fn parse_shell_id(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                let is_shell_selector = name == "Selector"
                    && e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"Name" && a.value.as_ref() == b"ShellId"
                    });
                if name == "ShellId" || is_shell_selector {
                    if let Ok(Event::Text(t)) = reader.read_event() {
                        let id = t.unescape().unwrap_or_default().trim().to_string();
                        if !id.is_empty() {
                            return Some(id);
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Extract the command id from a Command response.
pub fn parse_command_id(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"CommandId" {
                    if let Ok(Event::Text(t)) = reader.read_event() {
                        return Some(t.unescape().unwrap_or_default().trim().to_string());
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Parse a Receive response: base64 stream chunks, command state, exit code.
pub fn parse_receive(xml: &str) -> ReceiveOutput {
    let mut out = ReceiveOutput::default();
    let mut reader = Reader::from_str(xml);
    let mut pending_stream: Option<String> = None;
    let mut in_exit_code = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"Stream" => {
                        pending_stream = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"Name")
                            .map(|a| String::from_utf8_lossy(a.value.as_ref()).to_string());
                    }
                    b"CommandState" => {
                        if e.attributes().flatten().any(|a| {
                            a.key.as_ref() == b"State"
                                && a.value.as_ref().ends_with(b"CommandState/Done")
                        }) {
                            out.done = true;
                        }
                    }
                    b"ExitCode" => in_exit_code = true,
                    _ => {}
                }
            }
            // Self-closing forms: <rsp:CommandState .../>, <rsp:Stream ... End="true"/>
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"CommandState"
                    && e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"State"
                            && a.value.as_ref().ends_with(b"CommandState/Done")
                    })
                {
                    out.done = true;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                if in_exit_code {
                    out.exit_code = text.trim().parse().ok();
                } else if let Some(stream) = pending_stream.as_deref() {
                    if let Ok(bytes) = BASE64.decode(text.trim()) {
                        match stream {
                            "stdout" => out.stdout.extend_from_slice(&bytes),
                            "stderr" => out.stderr.extend_from_slice(&bytes),
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"Stream" => pending_stream = None,
                b"ExitCode" => in_exit_code = false,
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => return out,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_id_parsed_from_selector_form() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
            xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd">
          <s:Body>
            <x:ResourceCreated xmlns:x="http://schemas.xmlsoap.org/ws/2004/09/transfer">
              <w:SelectorSet><w:Selector Name="ShellId">D5A2622B-3246-4D41-9933-6A9E5B8B3A6B</w:Selector></w:SelectorSet>
            </x:ResourceCreated>
          </s:Body>
        </s:Envelope>"#;
        assert_eq!(
            parse_shell_id(xml).as_deref(),
            Some("D5A2622B-3246-4D41-9933-6A9E5B8B3A6B")
        );
    }

    #[test]
    fn shell_id_parsed_from_body_form() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
          <s:Body>
            <rsp:Shell xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
              <rsp:ShellId>ABC-123</rsp:ShellId>
            </rsp:Shell>
          </s:Body>
        </s:Envelope>"#;
        assert_eq!(parse_shell_id(xml).as_deref(), Some("ABC-123"));
    }

    #[test]
    fn receive_response_decodes_streams_and_exit_code() {
        let stdout_b64 = BASE64.encode(b"build ok\n");
        let stderr_b64 = BASE64.encode(b"warning\n");
        let xml = format!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
          <s:Body>
            <rsp:ReceiveResponse xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
              <rsp:Stream Name="stdout" CommandId="X">{stdout_b64}</rsp:Stream>
              <rsp:Stream Name="stderr" CommandId="X">{stderr_b64}</rsp:Stream>
              <rsp:CommandState CommandId="X" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done">
                <rsp:ExitCode>1</rsp:ExitCode>
              </rsp:CommandState>
            </rsp:ReceiveResponse>
          </s:Body>
        </s:Envelope>"#
        );
        let out = parse_receive(&xml);
        assert_eq!(out.stdout, b"build ok\n");
        assert_eq!(out.stderr, b"warning\n");
        assert!(out.done);
        assert_eq!(out.exit_code, Some(1));
    }

    #[test]
    fn running_state_is_not_done() {
        let xml = r#"<rsp:ReceiveResponse xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
          <rsp:CommandState CommandId="X" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/>
        </rsp:ReceiveResponse>"#;
        let out = parse_receive(xml);
        assert!(!out.done);
        assert_eq!(out.exit_code, None);
    }

    #[test]
    fn command_body_escapes_xml_metacharacters() {
        let body = command_body(r#"cd C:\ws & echo "a<b""#);
        assert!(body.contains("&amp;"));
        assert!(body.contains("&lt;"));
        assert!(!body.contains("echo \"a<b\""));
    }
}
