//! Request router
//!
//! Routes are registered per op-code with a match rule and a handler
//! chain. For an incoming request the most specific matching rule wins:
//!
//! ```text
//!   Exact(name)  >  Suffix(longer)  >  Suffix(shorter)  >  Any
//! ```
//!
//! The chain then runs in order. Each handler returns a [`Next`]:
//! `Continue` runs the following handler, `Abort` ends the chain with an
//! error response, `Done` ends it (finalizing with success if the handler
//! did not). A chain that runs out without answering is finalized with
//! `Other`.

use std::collections::HashMap;
use std::sync::Arc;

use super::response::ResponseWriter;
use crate::error::{AtlasError, Result};
use crate::name::DirName;
use crate::protocol::{Control, LdapResult, MessageId, OpCode, Request, ResultCode};

/// Which targets a route accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRule {
    /// Only this name
    Exact(DirName),
    /// This name and everything below it
    Suffix(DirName),
    /// Anything
    Any,
}

impl MatchRule {
    pub fn exact(name: &str) -> Result<Self> {
        Ok(MatchRule::Exact(DirName::parse(name)?))
    }

    pub fn suffix(name: &str) -> Result<Self> {
        Ok(MatchRule::Suffix(DirName::parse(name)?))
    }

    pub fn matches(&self, target: &DirName) -> bool {
        match self {
            MatchRule::Exact(name) => name == target,
            MatchRule::Suffix(name) => name.is_suffix_of(target),
            MatchRule::Any => true,
        }
    }

    /// Larger is more specific
    fn specificity(&self) -> (u8, usize) {
        match self {
            MatchRule::Exact(name) => (2, name.len()),
            MatchRule::Suffix(name) => (1, name.len()),
            MatchRule::Any => (0, 0),
        }
    }
}

/// What a handler wants to happen next
#[derive(Debug)]
pub enum Next {
    /// Run the next handler in the chain
    Continue,
    /// Stop and answer with this error
    Abort(AtlasError),
    /// Stop; the request is answered
    Done,
}

/// Everything a handler knows about the request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: MessageId,
    pub request: Request,
    /// Normalized routing target (an OID for extended requests)
    pub target: DirName,
    pub controls: Vec<Control>,
    pub peer: String,
    /// Name bound on this connection when the request arrived; empty if anonymous
    pub bound_dn: String,
}

impl RequestContext {
    pub fn op(&self) -> OpCode {
        self.request.op()
    }
}

pub type Handler = Arc<dyn Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync>;

struct Route {
    rule: MatchRule,
    chain: Vec<Handler>,
}

/// Match index from (op-code, target) to handler chains
#[derive(Default)]
pub struct Router {
    routes: HashMap<OpCode, Vec<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add handlers for `op` under `rule`
    ///
    /// Registering the same rule again extends its chain.
    pub fn register(&mut self, op: OpCode, rule: MatchRule, chain: Vec<Handler>) -> &mut Self {
        let routes = self.routes.entry(op).or_default();
        match routes.iter_mut().find(|route| route.rule == rule) {
            Some(route) => route.chain.extend(chain),
            None => routes.push(Route { rule, chain }),
        }
        self
    }

    /// Add one handler for `op` under `rule`
    pub fn handle<F>(&mut self, op: OpCode, rule: MatchRule, handler: F) -> &mut Self
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        self.register(op, rule, vec![Arc::new(handler)])
    }

    pub fn bind<F>(&mut self, rule: MatchRule, handler: F) -> &mut Self
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        self.handle(OpCode::BindRequest, rule, handler)
    }

    pub fn search<F>(&mut self, rule: MatchRule, handler: F) -> &mut Self
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        self.handle(OpCode::SearchRequest, rule, handler)
    }

    pub fn add<F>(&mut self, rule: MatchRule, handler: F) -> &mut Self
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        self.handle(OpCode::AddRequest, rule, handler)
    }

    pub fn delete<F>(&mut self, rule: MatchRule, handler: F) -> &mut Self
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        self.handle(OpCode::DelRequest, rule, handler)
    }

    pub fn modify<F>(&mut self, rule: MatchRule, handler: F) -> &mut Self
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        self.handle(OpCode::ModifyRequest, rule, handler)
    }

    pub fn modify_dn<F>(&mut self, rule: MatchRule, handler: F) -> &mut Self
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        self.handle(OpCode::ModifyDnRequest, rule, handler)
    }

    pub fn compare<F>(&mut self, rule: MatchRule, handler: F) -> &mut Self
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        self.handle(OpCode::CompareRequest, rule, handler)
    }

    /// Handle the extended operation `oid`
    pub fn extended<F>(&mut self, oid: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        Ok(self.handle(OpCode::ExtendedRequest, MatchRule::exact(oid)?, handler))
    }

    /// Observe unbinds; the connection closes afterwards regardless
    pub fn unbind<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&RequestContext, &mut ResponseWriter) -> Next + Send + Sync + 'static,
    {
        self.handle(OpCode::UnbindRequest, MatchRule::Any, handler)
    }

    /// The chain of the most specific route matching `target`
    pub fn resolve(&self, op: OpCode, target: &DirName) -> Option<&[Handler]> {
        self.routes
            .get(&op)?
            .iter()
            .filter(|route| route.rule.matches(target))
            .max_by_key(|route| route.rule.specificity())
            .map(|route| route.chain.as_slice())
    }

    /// Run the matching chain for one request
    pub fn dispatch(&self, ctx: &RequestContext, response: &mut ResponseWriter) {
        let op = ctx.op();
        let Some(chain) = self.resolve(op, &ctx.target) else {
            if op.response().is_some() {
                let error = AtlasError::NoMatchingHandler {
                    op,
                    target: ctx.request.target().to_string(),
                };
                tracing::debug!(id = %ctx.id, error = %error, "no route");
                if let Err(e) = response.fail(&error) {
                    tracing::debug!(id = %ctx.id, error = %e, "no-route response failed");
                }
            }
            return;
        };

        for handler in chain {
            match handler(ctx, response) {
                Next::Continue => continue,
                Next::Done => {
                    if !response.is_finalized() {
                        if let Err(e) = response.end(LdapResult::success()) {
                            tracing::debug!(id = %ctx.id, error = %e, "final response failed");
                        }
                    }
                    return;
                }
                Next::Abort(error) => {
                    if response.is_finalized() {
                        tracing::error!(id = %ctx.id, error = %error, "chain aborted after the response was finalized");
                    } else if let Err(e) = response.fail(&error) {
                        tracing::debug!(id = %ctx.id, error = %e, "error response failed");
                    }
                    return;
                }
            }
        }

        if !response.is_finalized() && op.response().is_some() {
            tracing::warn!(id = %ctx.id, ?op, "handler chain ended without a response");
            let result = LdapResult::new(ResultCode::Other, "no handler answered the request");
            if let Err(e) = response.end(result) {
                tracing::debug!(id = %ctx.id, error = %e, "fallback response failed");
            }
        }
    }
}
