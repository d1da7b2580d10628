//! Authoritative per-source breakpoint set, reconciled against the backend.
//!
//! `setBreakpoints` is authoritative per file: everything the backend holds
//! for that file is cleared first, then the requested set is re-created.
//! A creation that fails because the breakpoint already exists is adopted
//! from one `ListBreakpoints` fetch instead of surfacing an error.

use crate::api::{Api, BackendBreakpoint};
use crate::config::LoadConfig;
use crate::dap_types;
use indexmap::IndexMap;
use log::{info, warn};
use std::error::Error;

#[derive(Debug, Default)]
pub struct BreakpointStore {
    by_file: IndexMap<String, Vec<BackendBreakpoint>>,
}

fn is_already_exists(message: &str) -> bool {
    message.contains("already exists") || message.starts_with("Breakpoint exists")
}

impl BreakpointStore {
    pub fn new() -> BreakpointStore {
        BreakpointStore::default()
    }

    pub fn records_for(&self, local_file: &str) -> &[BackendBreakpoint] {
        self.by_file
            .get(local_file)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replace the breakpoint set for one file. The response preserves the
    /// request order; unverified entries report the requested line.
    pub fn reconcile(
        &mut self,
        api: &dyn Api,
        local_file: &str,
        remote_file: &str,
        requested: &[dap_types::SourceBreakpoint],
        load: &LoadConfig,
    ) -> Result<Vec<dap_types::Breakpoint>, Box<dyn Error>> {
        for previous in self.by_file.swap_remove(local_file).unwrap_or_default() {
            if let Err(e) = api.clear_breakpoint(previous.id) {
                warn!(
                    "could not clear breakpoint {} in {local_file}: {e}",
                    previous.id
                );
            }
        }

        let mut listing: Option<Vec<BackendBreakpoint>> = None;
        let mut records = vec![];
        let mut response = vec![];
        for request in requested {
            let shape = BackendBreakpoint {
                file: remote_file.to_string(),
                line: request.line,
                cond: request.condition.clone(),
                load_args: Some(load.clone()),
                load_locals: Some(load.clone()),
                ..Default::default()
            };
            match api.create_breakpoint(&shape) {
                Ok(record) => {
                    info!(
                        "created breakpoint {} at {remote_file}:{}",
                        record.id, record.line
                    );
                    response.push(dap_types::Breakpoint {
                        id: Some(record.id),
                        verified: true,
                        line: Some(record.line),
                        ..Default::default()
                    });
                    records.push(record);
                }
                Err(e) if is_already_exists(&e.to_string()) => {
                    if listing.is_none() {
                        listing = Some(api.list_breakpoints().unwrap_or_else(|e| {
                            warn!("could not list breakpoints for recovery: {e}");
                            vec![]
                        }));
                    }
                    let adopted = listing
                        .as_ref()
                        .and_then(|all| {
                            all.iter()
                                .find(|bp| bp.file == remote_file && bp.line == request.line)
                        })
                        .cloned();
                    match adopted {
                        Some(record) => {
                            info!(
                                "adopted existing breakpoint {} at {remote_file}:{}",
                                record.id, record.line
                            );
                            response.push(dap_types::Breakpoint {
                                id: Some(record.id),
                                verified: true,
                                line: Some(record.line),
                                ..Default::default()
                            });
                            records.push(record);
                        }
                        None => {
                            response.push(dap_types::Breakpoint {
                                verified: false,
                                line: Some(request.line),
                                ..Default::default()
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!("could not create breakpoint at {remote_file}:{}: {e}", request.line);
                    response.push(dap_types::Breakpoint {
                        verified: false,
                        line: Some(request.line),
                        ..Default::default()
                    });
                }
            }
        }
        self.by_file.insert(local_file.to_string(), records);
        Ok(response)
    }
}
