use dlv_bridge::dap::{from_json, from_reader, to_json, write_message, DapMessage, ProtocolMessage, Response};
use dlv_bridge::dap_types;
use serde_json::json;
use std::io::BufReader;

#[test]
fn test_parse_initialize_request() {
    let json_text = r#"{"seq":1,"type":"request","command":"initialize","arguments":{"adapterID":"go"}}"#;
    let message = from_json(json_text).expect("valid message");
    match message {
        DapMessage::Request(req) => {
            assert_eq!(req.base.seq, 1);
            assert_eq!(req.command, "initialize");
            let args: dap_types::InitializeRequestArguments = req.load_args().expect("args");
            assert_eq!(args.adapter_id, "go");
        }
        _ => panic!("expected request"),
    }
}

#[test]
fn test_parse_launch_arguments() {
    let json_text = r#"{"seq":2,"type":"request","command":"launch","arguments":{
        "program":"/w/main.go","stopOnEntry":false,"apiVersion":2,"port":38000,
        "mode":"debug","env":{"A":"1"},"showGlobalVariables":true}}"#;
    let message = from_json(json_text).expect("valid message");
    match message {
        DapMessage::Request(req) => {
            let args: dlv_bridge::config::LaunchArguments = req.load_args().expect("args");
            assert_eq!(args.program.as_deref(), Some("/w/main.go"));
            assert_eq!(args.port, Some(38000));
            assert_eq!(args.api_version, Some(2));
            assert!(args.show_global_variables);
            assert_eq!(args.env.get("A").map(String::as_str), Some("1"));
        }
        _ => panic!("expected request"),
    }
}

#[test]
fn test_serialize_initialize_response() {
    let body = json!({
        "supportsConfigurationDoneRequest": true,
        "supportsSetVariable": true,
        "supportsConditionalBreakpoints": true
    });
    let resp = Response {
        base: ProtocolMessage {
            seq: 2,
            type_: "response".to_string(),
        },
        request_seq: 1,
        success: true,
        command: "initialize".to_string(),
        message: None,
        body,
    };
    let original = DapMessage::Response(resp);
    let json_text = to_json(&original).expect("serialize");
    let deserialized = from_json(&json_text).expect("deserialize");
    assert_eq!(original, deserialized);
}

#[test]
fn test_session_sequence_parse() {
    let messages = vec![
        r#"{"seq":1,"type":"request","command":"initialize","arguments":{}}"#,
        r#"{"seq":2,"type":"response","request_seq":1,"success":true,"command":"initialize","body":{"supportsConfigurationDoneRequest":true,"supportsSetVariable":true}}"#,
        r#"{"seq":3,"type":"event","event":"initialized"}"#,
        r#"{"seq":4,"type":"request","command":"launch","arguments":{"program":"/w/main.go"}}"#,
        r#"{"seq":5,"type":"response","request_seq":4,"success":true,"command":"launch"}"#,
        r#"{"seq":6,"type":"event","event":"stopped","body":{"reason":"breakpoint","threadId":1,"allThreadsStopped":true}}"#,
    ];
    let parsed: Vec<_> = messages.iter().map(|m| from_json(m).unwrap()).collect();
    assert_eq!(parsed.len(), messages.len());
    match &parsed[1] {
        DapMessage::Response(resp) => {
            assert_eq!(resp.command, "initialize");
            assert!(resp.body["supportsConfigurationDoneRequest"].as_bool().unwrap());
            assert!(resp.body["supportsSetVariable"].as_bool().unwrap());
        }
        _ => panic!("unexpected type"),
    }
    match &parsed[2] {
        DapMessage::Event(ev) => assert_eq!(ev.event, "initialized"),
        _ => panic!("unexpected type"),
    }
    match &parsed[5] {
        DapMessage::Event(ev) => {
            assert_eq!(ev.event, "stopped");
            assert_eq!(ev.body["reason"], "breakpoint");
            assert_eq!(ev.body["allThreadsStopped"], true);
        }
        _ => panic!("unexpected type"),
    }
}

#[test]
fn test_content_length_framing_round_trip() {
    let original = DapMessage::Event(dlv_bridge::dap::Event {
        base: ProtocolMessage {
            seq: 9,
            type_: "event".to_string(),
        },
        event: "output".to_string(),
        body: json!({"category": "stdout", "output": "hello\n"}),
    });
    let mut buffer: Vec<u8> = vec![];
    write_message(&mut buffer, &original).expect("write");
    let text = String::from_utf8(buffer.clone()).expect("utf8");
    assert!(text.starts_with("Content-Length:"));

    let mut reader = BufReader::new(&buffer[..]);
    let read_back = from_reader(&mut reader).expect("read");
    assert_eq!(original, read_back);
}

#[test]
fn test_missing_content_length_is_an_error() {
    let bytes = b"Not-A-Header: 3\r\n\r\n{}".to_vec();
    let mut reader = BufReader::new(&bytes[..]);
    assert!(from_reader(&mut reader).is_err());
}
