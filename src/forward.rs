use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::{Name, RData, Record};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::proto::{append_search_domain, build_reply, fqdn_lower, name_dots};
use crate::stats::Stats;
use crate::upstream::{Exchanger, Transport};

/// TTL on the CNAME synthesized for a search-domain match.
const SEARCH_CNAME_TTL: u32 = 360;

/// Decides, per query, whether to refuse, try the literal name, iterate
/// through search domains, and how to combine the results. Falls back to a
/// captured stale cache entry when every upstream fails.
#[derive(Clone)]
pub struct Forwarder {
    config: Arc<Config>,
    exchanger: Exchanger,
    stats: Arc<Stats>,
}

impl Forwarder {
    pub fn new(config: Arc<Config>, exchanger: Exchanger, stats: Arc<Stats>) -> Self {
        Self {
            config,
            exchanger,
            stats,
        }
    }

    /// Resolves `req` through the upstreams. Returns the response to send and
    /// whether it came from the stale candidate.
    pub async fn serve_forward(
        &self,
        req: &Message,
        transport: Transport,
        stale: Option<Message>,
    ) -> (Message, bool) {
        let Some(question) = req.queries().first().cloned() else {
            return (build_reply(req, ResponseCode::FormErr), false);
        };
        let name = fqdn_lower(question.name());
        let dots = name_dots(question.name());

        let refuse = if self.config.no_recursion {
            debug!(id = req.id(), "refusing query, recursion disabled");
            true
        } else if self.config.nameservers.is_empty() {
            debug!(id = req.id(), "refusing query, no nameservers configured");
            true
        } else if dots < self.config.fwd_ndots && !self.config.enable_search {
            debug!(id = req.id(), qname = %name, "refusing query, qname too short to forward");
            true
        } else {
            false
        };
        if refuse {
            return (build_reply(req, ResponseCode::Refused), false);
        }

        self.stats.forward_count.inc();

        let search_enabled = self.config.enable_search && !self.config.search_domains.is_empty();
        let mut absolute: Option<anyhow::Result<Message>> = None;
        let mut search: Option<anyhow::Result<Message>> = None;

        // with enough dots, resolve the literal name first
        if dots >= self.config.ndots && dots >= self.config.fwd_ndots {
            debug!(id = req.id(), "doing initial absolute lookup");
            match self.forward_query(req, transport).await {
                Ok(mut resp) if resp.response_code() == ResponseCode::NoError => {
                    debug!(id = req.id(), "initial lookup yielded result");
                    resp.set_id(req.id());
                    return (resp, false);
                }
                res => {
                    if let Err(err) = &res {
                        warn!(id = req.id(), qname = %name, error = %err, "error looking up literal qname with upstreams");
                    }
                    absolute = Some(res);
                }
            }
        }

        // at least one level of search, unless the upstreams already failed
        if !matches!(absolute, Some(Err(_))) && search_enabled {
            debug!(id = req.id(), "doing search lookup");
            match self.forward_search(req, transport).await {
                Ok(mut resp) if resp.response_code() == ResponseCode::NoError => {
                    debug!(id = req.id(), "search lookup yielded result");
                    resp.set_id(req.id());
                    return (resp, false);
                }
                res => {
                    if let Err(err) = &res {
                        warn!(id = req.id(), qname = %name, error = %err, "error looking up qname with search");
                    }
                    search = Some(res);
                }
            }
        }

        // the absolute lookup may still be pending from step one
        if !matches!(search, Some(Err(_))) && absolute.is_none() && dots >= self.config.fwd_ndots {
            debug!(id = req.id(), "doing absolute lookup");
            match self.forward_query(req, transport).await {
                Ok(mut resp) if resp.response_code() == ResponseCode::NoError => {
                    debug!(id = req.id(), "absolute lookup yielded result");
                    resp.set_id(req.id());
                    return (resp, false);
                }
                res => {
                    if let Err(err) = &res {
                        warn!(id = req.id(), qname = %name, error = %err, "error resolving literal qname");
                    }
                    absolute = Some(res);
                }
            }
        }

        // no positive result: prefer the absolute response, then a synthetic
        // message carrying the last search rcode, then SERVFAIL
        let fallback = if let Some(Ok(mut resp)) = absolute {
            debug!(id = req.id(), rcode = %resp.response_code(), "returning response of absolute lookup");
            resp.set_id(req.id());
            resp
        } else if let Some(Ok(resp)) = search {
            info!(id = req.id(), rcode = %resp.response_code(), "returning no-data response");
            self.stats.no_data_count.inc();
            build_reply(req, resp.response_code())
        } else {
            debug!(id = req.id(), "error forwarding query, returning SERVFAIL");
            build_reply(req, ResponseCode::ServFail)
        };

        match stale {
            Some(stale_resp) => {
                info!(id = req.id(), "stale cache record available, serving it instead");
                self.stats.stale_cache_hit.inc();
                (stale_resp, true)
            }
            None => {
                self.stats.request_fail.inc();
                (fallback, false)
            }
        }
    }

    /// Resolves a query by suffixing the name with each search domain in turn.
    async fn forward_search(
        &self,
        req: &Message,
        transport: Transport,
    ) -> anyhow::Result<Message> {
        let Some(question) = req.queries().first().cloned() else {
            return Ok(build_reply(req, ResponseCode::FormErr));
        };
        let name = fqdn_lower(question.name());
        let mut req_copy = req.clone();
        let mut nodata: Option<Message> = None;
        let mut outcome: Option<anyhow::Result<Message>> = None;
        let mut searched: Option<Name> = None;

        for domain in &self.config.search_domains {
            if name.ends_with(domain.as_str()) {
                continue;
            }
            let candidate = append_search_domain(&name, domain);
            let candidate_name = match Name::from_ascii(&candidate) {
                Ok(n) => n,
                Err(err) => {
                    debug!(candidate = %candidate, error = %err, "skipping unusable search candidate");
                    continue;
                }
            };
            let mut query = question.clone();
            query.set_name(candidate_name.clone());
            req_copy.take_queries();
            req_copy.add_query(query);
            searched = Some(candidate_name);

            match self.forward_query(&req_copy, transport).await {
                Err(err) => {
                    // no server currently available, give up
                    outcome = Some(Err(err));
                    break;
                }
                Ok(resp) => match resp.response_code() {
                    ResponseCode::NoError => {
                        if resp.answers().is_empty() && !resp.truncated() {
                            // NODATA: keep searching, otherwise a wildcard
                            // entry could shadow an answer higher in the list
                            nodata = Some(resp.clone());
                            outcome = Some(Ok(resp));
                            continue;
                        }
                        outcome = Some(Ok(resp));
                        break;
                    }
                    ResponseCode::NXDomain | ResponseCode::ServFail => {
                        outcome = Some(Ok(resp));
                        continue;
                    }
                    _ => {
                        outcome = Some(Ok(resp));
                        break;
                    }
                },
            }
        }

        let Some(outcome) = outcome else {
            // every search domain was already a suffix of the name
            return Ok(build_reply(req, ResponseCode::NXDomain));
        };

        match outcome {
            Ok(mut resp) => {
                if resp.response_code() == ResponseCode::NoError && !resp.answers().is_empty() {
                    if let Some(target) = searched {
                        let cname = Record::from_rdata(
                            question.name().clone(),
                            SEARCH_CNAME_TTL,
                            RData::CNAME(CNAME(target)),
                        );
                        let mut answers = vec![cname];
                        answers.extend(resp.take_answers());
                        resp.insert_answers(answers);
                    }
                    restore_question(&mut resp, &question);
                    Ok(resp)
                } else if let Some(mut nodata) = nodata {
                    restore_question(&mut nodata, &question);
                    Ok(nodata)
                } else {
                    restore_question(&mut resp, &question);
                    Ok(resp)
                }
            }
            Err(err) => {
                if let Some(mut nodata) = nodata {
                    restore_question(&mut nodata, &question);
                    Ok(nodata)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Tries the upstream list in order, stopping on a terminal rcode.
    async fn forward_query(
        &self,
        req: &Message,
        transport: Transport,
    ) -> anyhow::Result<Message> {
        let name = req
            .queries()
            .first()
            .map(|q| fqdn_lower(q.name()))
            .unwrap_or_default();

        let mut nameservers: &[SocketAddr] = &self.config.nameservers;
        for stub in &self.config.stub_zones {
            if name.ends_with(stub.zone.as_str()) {
                debug!(qname = %name, zone = %stub.zone, "routing through stub zone");
                nameservers = &stub.nameservers;
                self.stats.stub_forward_count.inc();
                break;
            }
        }

        let mut last: anyhow::Result<Message> = Err(anyhow!("no nameservers configured"));
        for upstream in nameservers {
            debug!(id = req.id(), upstream = %upstream, qname = %name, "querying upstream");
            match self.exchanger.exchange(req, *upstream, transport).await {
                Err(err) => {
                    debug!(id = req.id(), upstream = %upstream, error = %err, "failed to query upstream");
                    last = Err(err);
                }
                Ok(resp) => {
                    let rcode = resp.response_code();
                    debug!(id = req.id(), upstream = %upstream, rcode = %rcode, "response code from upstream");
                    if rcode == ResponseCode::NXDomain {
                        self.stats.name_error_count.inc();
                    }
                    // with cache_non_negative any negative status means try
                    // the next upstream
                    let retry_negative =
                        self.config.cache_non_negative && rcode != ResponseCode::NoError;
                    let terminal = !retry_negative
                        && matches!(
                            rcode,
                            ResponseCode::NoError
                                | ResponseCode::NXDomain
                                | ResponseCode::FormErr
                                | ResponseCode::Refused
                                | ResponseCode::NotImp
                        );
                    last = Ok(resp);
                    if terminal {
                        return last;
                    }
                }
            }
        }
        last
    }
}

fn restore_question(msg: &mut Message, question: &Query) {
    msg.take_queries();
    msg.add_query(question.clone());
}
