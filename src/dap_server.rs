//! The session event loop: one merged channel carries client requests and
//! asynchronous backend completions, so a single owner drives all session
//! state.

use crate::config::{AttachArguments, LaunchArguments};
use crate::dap::{self, DapMessage, ProtocolMessage, Request, Response};
use crate::dap_types;
use crate::events::SessionEvent;
use crate::handler::{Handler, ERR_START_SESSION};
use crate::transport::DapTransport;
use log::{info, warn};
use serde_json::json;
use std::error::Error;
use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;

pub struct Ctx {
    pub seq: i64,
    pub handler: Option<Handler>,
    pub events_tx: mpsc::Sender<SessionEvent>,
    pub disconnected: bool,
}

impl Ctx {
    fn new(events_tx: mpsc::Sender<SessionEvent>) -> Ctx {
        Ctx {
            seq: 1,
            handler: None,
            events_tx,
            disconnected: false,
        }
    }
}

pub fn run_stdio() -> Result<(), Box<dyn Error>> {
    let stdin = std::io::stdin();
    let reader = BufReader::new(stdin);
    let mut writer = std::io::stdout();
    serve(reader, &mut writer)
}

/// Listen for exactly one client connection.
pub fn run_tcp(port: u16) -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    info!("listening for a DAP client on 127.0.0.1:{port}");
    let (stream, peer) = listener.accept()?;
    info!("DAP client connected from {peer}");
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    serve(reader, &mut writer)
}

pub fn serve<R, T>(mut reader: R, transport: &mut T) -> Result<(), Box<dyn Error>>
where
    R: BufRead + Send + 'static,
    T: DapTransport,
{
    let (events_tx, events_rx) = mpsc::channel();
    let reader_tx = events_tx.clone();
    thread::spawn(move || {
        loop {
            match dap::from_reader(&mut reader) {
                Ok(message) => {
                    if reader_tx.send(SessionEvent::Client(message)).is_err() {
                        return;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = reader_tx.send(SessionEvent::ClientClosed);
    });

    let mut ctx = Ctx::new(events_tx);
    while let Ok(event) = events_rx.recv() {
        match event {
            SessionEvent::Client(DapMessage::Request(request)) => {
                let result = handle_request(&mut ctx, request, transport);
                if let Err(e) = result {
                    warn!("request handling error: {e}");
                }
            }
            SessionEvent::Client(other) => {
                info!("ignoring non-request client message: {other:?}");
            }
            SessionEvent::ContinueDone { epoch, result } => {
                if let Some(handler) = ctx.handler.as_mut() {
                    handler.on_continue_done(epoch, result)?;
                    flush(transport, &mut ctx)?;
                }
            }
            SessionEvent::Output { category, chunk } => {
                if let Some(handler) = ctx.handler.as_mut() {
                    handler.on_output(category, &chunk);
                    flush(transport, &mut ctx)?;
                }
            }
            SessionEvent::BackendExited { code } => {
                if let Some(handler) = ctx.handler.as_mut() {
                    handler.on_backend_exited(code);
                    flush(transport, &mut ctx)?;
                }
            }
            SessionEvent::ClientClosed => break,
        }
        if ctx.disconnected {
            break;
        }
    }
    Ok(())
}

fn flush<T: DapTransport>(transport: &mut T, ctx: &mut Ctx) -> Result<(), Box<dyn Error>> {
    if let Some(handler) = ctx.handler.as_mut() {
        for message in handler.dap.take_messages() {
            transport.send(&message)?;
        }
        ctx.seq = handler.dap.seq;
    }
    Ok(())
}

fn send_response<T: DapTransport>(
    transport: &mut T,
    ctx: &mut Ctx,
    request: &Request,
    success: bool,
    message: Option<String>,
    body: serde_json::Value,
) -> Result<(), Box<dyn Error>> {
    let response = DapMessage::Response(Response {
        base: ProtocolMessage {
            seq: ctx.seq,
            type_: "response".to_string(),
        },
        request_seq: request.base.seq,
        success,
        command: request.command.clone(),
        message,
        body,
    });
    ctx.seq += 1;
    transport.send(&response)?;
    Ok(())
}

fn send_error<T: DapTransport>(
    transport: &mut T,
    ctx: &mut Ctx,
    request: &Request,
    code: i64,
    text: &str,
) -> Result<(), Box<dyn Error>> {
    let body = dap_types::ErrorResponseBody {
        error: Some(dap_types::Message {
            id: code,
            format: text.to_string(),
            show_user: Some(true),
        }),
    };
    send_response(
        transport,
        ctx,
        request,
        false,
        Some(text.to_string()),
        json!(body),
    )
}

fn handle_request<T: DapTransport>(
    ctx: &mut Ctx,
    request: Request,
    transport: &mut T,
) -> Result<(), Box<dyn Error>> {
    info!("request {}", request.command);
    match request.command.as_str() {
        "initialize" => {
            let capabilities = dap_types::Capabilities {
                supports_configuration_done_request: Some(true),
                supports_set_variable: Some(true),
                supports_conditional_breakpoints: Some(true),
            };
            send_response(transport, ctx, &request, true, None, json!(capabilities))?;
        }
        "launch" => {
            let args: LaunchArguments = match request.load_args() {
                Ok(args) => args,
                Err(e) => {
                    return send_error(
                        transport,
                        ctx,
                        &request,
                        ERR_START_SESSION,
                        &format!("Failed to launch: {e}"),
                    );
                }
            };
            match Handler::launch(&args, ctx.events_tx.clone(), ctx.seq) {
                Ok(mut handler) => {
                    handler.dap.respond(&request, json!({}));
                    ctx.handler = Some(handler);
                    flush(transport, ctx)?;
                }
                Err(e) => {
                    send_error(
                        transport,
                        ctx,
                        &request,
                        e.code,
                        &format!("Failed to launch: {}", e.message),
                    )?;
                }
            }
        }
        "attach" => {
            let args: AttachArguments = match request.load_args() {
                Ok(args) => args,
                Err(e) => {
                    return send_error(
                        transport,
                        ctx,
                        &request,
                        ERR_START_SESSION,
                        &format!("Failed to attach: {e}"),
                    );
                }
            };
            match Handler::attach(&args, ctx.events_tx.clone(), ctx.seq) {
                Ok(mut handler) => {
                    handler.dap.respond(&request, json!({}));
                    ctx.handler = Some(handler);
                    flush(transport, ctx)?;
                }
                Err(e) => {
                    send_error(
                        transport,
                        ctx,
                        &request,
                        e.code,
                        &format!("Failed to attach: {}", e.message),
                    )?;
                }
            }
        }
        "disconnect" => {
            if let Some(handler) = ctx.handler.as_mut() {
                handler.disconnect(request.clone(), request.load_args().unwrap_or_default())?;
                flush(transport, ctx)?;
            } else {
                send_response(transport, ctx, &request, true, None, json!({}))?;
            }
            ctx.disconnected = true;
        }
        _ => {
            let Some(handler) = ctx.handler.as_mut() else {
                return send_error(
                    transport,
                    ctx,
                    &request,
                    ERR_START_SESSION,
                    "no debug session is running",
                );
            };
            handler.dap.seq = ctx.seq;
            let result = dispatch_session_request(handler, request.clone());
            if let Err(e) = result {
                warn!("{} failed: {e}", request.command);
                handler
                    .dap
                    .respond_error(&request, ERR_START_SESSION, &format!("{e}"));
            }
            flush(transport, ctx)?;
        }
    }
    Ok(())
}

fn dispatch_session_request(handler: &mut Handler, request: Request) -> Result<(), Box<dyn Error>> {
    match request.command.as_str() {
        "configurationDone" => handler.configuration_done(request),
        "setBreakpoints" => {
            let args = request.load_args::<dap_types::SetBreakpointsArguments>()?;
            handler.set_breakpoints(request, args)
        }
        "threads" => handler.threads(request),
        "stackTrace" => {
            let args = request.load_args::<dap_types::StackTraceArguments>()?;
            handler.stack_trace(request, args)
        }
        "scopes" => {
            let args = request.load_args::<dap_types::ScopesArguments>()?;
            handler.scopes(request, args)
        }
        "variables" => {
            let args = request.load_args::<dap_types::VariablesArguments>()?;
            handler.variables(request, args)
        }
        "continue" => {
            let args = request.load_args::<dap_types::ContinueArguments>()?;
            handler.continue_request(request, args)
        }
        "next" => handler.step(request, "next"),
        "stepIn" => handler.step(request, "step"),
        "stepOut" => handler.step(request, "stepOut"),
        "pause" => {
            let args = request.load_args::<dap_types::PauseArguments>()?;
            handler.pause(request, args)
        }
        "evaluate" => {
            let args = request.load_args::<dap_types::EvaluateArguments>()?;
            handler.evaluate(request, args)
        }
        "setVariable" => {
            let args = request.load_args::<dap_types::SetVariableArguments>()?;
            handler.set_variable(request, args)
        }
        other => Err(format!("command {other} not supported here").into()),
    }
}
