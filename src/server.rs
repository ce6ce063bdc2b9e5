//! Per-query response state machine.
//!
//! The host calls [`Server::operate`] for every module event of a query. The
//! server decides whether the query is its own, answers it from the inventory
//! index, hands the answer to the host cache and records a revalidation task.
//! No state is kept between calls.

use std::sync::Arc;

use log::{debug, error, info, warn};
use rand::seq::SliceRandom;

use crate::cache::HostCache;
use crate::config::{ServerConfig, ServerMode};
use crate::errors::ResolverError;
use crate::inventory::{determine_address, AddressSource};
use crate::invalidator::Invalidator;
use crate::lookup::{InstanceLookup, Instances};
use crate::message::{Answer, QueryInfo, Rcode, RecordData, RecordType, ResourceRecord};
use crate::metrics::{self, QueryOutcome};
use crate::utils::{fqdn, in_zone};

/// Events the host delivers to the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleEvent {
    /// A new query.
    New,
    /// A query passed on from a previous module.
    Pass,
    /// A later module finished its work on the query.
    ModDone,
    /// Anything else.
    Other(u32),
}

/// Next state written back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Let the next module handle the query.
    WaitModule,
    /// The query is answered.
    Finished,
    /// The query failed.
    Error,
}

/// Mutable per-query context shared with the host.
#[derive(Debug, Clone)]
pub struct QueryState {
    /// The question being asked.
    pub qinfo: QueryInfo,

    /// Next state, set by the module.
    pub ext_state: Option<ModuleState>,

    /// Response code of the answer, if the module produced one.
    pub return_rcode: Option<Rcode>,

    /// The answer, if the module produced one.
    pub return_msg: Option<Answer>,
}

impl QueryState {
    pub fn new(qinfo: QueryInfo) -> Self {
        Self {
            qinfo,
            ext_state: None,
            return_rcode: None,
            return_msg: None,
        }
    }
}

/// How a query is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Forward,
    Reverse,
    Passthrough,
}

/// The response state machine for one managed zone.
pub struct Server {
    zone: String,
    reverse_zones: Vec<String>,
    forwarded_zones: Vec<String>,
    ttl: u32,
    cache_ttl: u32,
    mode: ServerMode,
    ip_order: Vec<AddressSource>,
    tag_name_include_domain: bool,
    lookup: Arc<dyn InstanceLookup>,
    cache: Arc<dyn HostCache>,
    invalidator: Option<Arc<Invalidator>>,
}

impl Server {
    pub fn new(
        config: &ServerConfig,
        lookup: Arc<dyn InstanceLookup>,
        cache: Arc<dyn HostCache>,
        invalidator: Option<Arc<Invalidator>>,
    ) -> Self {
        Self {
            zone: config.zone.clone(),
            reverse_zones: config.reverse_zones.clone(),
            forwarded_zones: config.forwarded_zones.clone(),
            ttl: config.ttl,
            cache_ttl: config.cache_ttl,
            mode: config.server_mode,
            ip_order: config.ip_order.clone(),
            tag_name_include_domain: config.tag_name_include_domain,
            lookup,
            cache,
            invalidator,
        }
    }

    /// Handle one module event for a query.
    ///
    /// Writes the next state into `qstate.ext_state` and returns it.
    pub async fn operate(&self, event: ModuleEvent, qstate: &mut QueryState) -> ModuleState {
        let state = match event {
            ModuleEvent::New | ModuleEvent::Pass => match self.route(&qstate.qinfo) {
                route @ (Route::Forward | Route::Reverse) => {
                    debug!("Handling {:?} query for {}", route, qstate.qinfo.name);
                    self.handle_forward(route, qstate).await
                }
                Route::Passthrough => self.handle_pass(),
            },
            ModuleEvent::ModDone => ModuleState::Finished,
            ModuleEvent::Other(code) => {
                warn!("Bad event {}", code);
                ModuleState::Error
            }
        };
        qstate.ext_state = Some(state);
        state
    }

    fn route(&self, qinfo: &QueryInfo) -> Route {
        if self.forwarded_zones.iter().any(|z| in_zone(&qinfo.name, z)) {
            return Route::Passthrough;
        }

        let address_query = matches!(qinfo.qtype, RecordType::A | RecordType::Any);
        let reverse_query = matches!(qinfo.qtype, RecordType::Ptr | RecordType::Any);

        if in_zone(&qinfo.name, &self.zone) {
            if address_query || self.mode == ServerMode::Authoritative {
                return Route::Forward;
            }
        } else if reverse_query && self.reverse_zones.iter().any(|z| in_zone(&qinfo.name, z)) {
            return Route::Reverse;
        }

        Route::Passthrough
    }

    fn handle_pass(&self) -> ModuleState {
        metrics::record_query(QueryOutcome::Passthrough);
        ModuleState::WaitModule
    }

    async fn handle_forward(&self, route: Route, qstate: &mut QueryState) -> ModuleState {
        let qinfo = qstate.qinfo.clone();

        let mut instances = match self.lookup.lookup(&qinfo.name).await {
            Ok(instances) => instances,
            Err(e) => {
                error!("Error looking up {} in inventory: {}", qinfo.name, e);
                metrics::record_query(QueryOutcome::Error);
                return ModuleState::Error;
            }
        };

        let mut answer = Answer::new(Rcode::NoError, self.mode == ServerMode::Authoritative);
        if instances.is_empty() {
            info!("No results found for {}", qinfo.name);
            answer.rcode = Rcode::NxDomain;
            metrics::record_query(QueryOutcome::NxDomain);
        } else {
            instances.shuffle(&mut rand::thread_rng());
            answer.records = self.records(route, &qinfo, &instances);
            metrics::record_query(QueryOutcome::Success);
        }

        qstate.return_rcode = Some(answer.rcode);
        qstate.return_msg = Some(answer.clone());

        if self.mode == ServerMode::Caching {
            self.remember(&qinfo, &answer, &instances);
        }
        ModuleState::Finished
    }

    /// Address records for forward names, PTR records for reverse names.
    fn records(&self, route: Route, qinfo: &QueryInfo, instances: &Instances) -> Vec<ResourceRecord> {
        let name = fqdn(&qinfo.name);
        let record = |data| ResourceRecord {
            name: name.clone(),
            ttl: self.ttl,
            data,
        };

        match (route, qinfo.qtype) {
            (Route::Forward, RecordType::A | RecordType::Any) => instances
                .iter()
                .filter_map(|i| determine_address(i, &self.ip_order))
                .map(|addr| record(RecordData::A(addr)))
                .collect(),
            (Route::Reverse, RecordType::Ptr | RecordType::Any) => instances
                .iter()
                .filter_map(|i| i.hostname(&self.zone, self.tag_name_include_domain))
                .map(|host| record(RecordData::Ptr(host)))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn remember(&self, qinfo: &QueryInfo, answer: &Answer, instances: &Instances) {
        let key = qinfo.key();
        if let Err(e) = self.cache.store(&key, answer, self.cache_ttl) {
            warn!("Unable to store {} in cache: {}", key, e);
            metrics::record_host_cache_failure("store");
            return;
        }

        let Some(invalidator) = &self.invalidator else {
            return;
        };
        match invalidator.request(key, instances) {
            Ok(()) => {}
            Err(ResolverError::QueueFull) => {
                warn!("Invalidator queue is full");
                metrics::record_queue_full();
            }
            Err(e) => warn!("Unable to track {} for invalidation: {}", qinfo.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AnswerCache;
    use crate::inventory::{InstanceDescriptor, StaticInventory, ADDRESS_TAG, NAME_TAG};
    use crate::invalidator::DrainType;
    use crate::lookup::{CacheLookup, DirectLookup};
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    fn config() -> ServerConfig {
        ServerConfig {
            zone: "example.com.".into(),
            ttl: 300,
            reverse_zones: vec!["10.in-addr.arpa.".into()],
            ..ServerConfig::default()
        }
    }

    fn host1() -> InstanceDescriptor {
        InstanceDescriptor::new("i-1")
            .with_tag(NAME_TAG, "host1.example.com.")
            .with_tag(ADDRESS_TAG, "10.0.0.5")
    }

    struct Fixture {
        inventory: Arc<StaticInventory>,
        cache: Arc<AnswerCache>,
        invalidator: Arc<Invalidator>,
        server: Server,
    }

    fn fixture(config: ServerConfig, instances: Vec<InstanceDescriptor>) -> Fixture {
        let inventory = Arc::new(StaticInventory::new(instances));
        let lookup: Arc<dyn InstanceLookup> = Arc::new(DirectLookup::new(
            inventory.clone(),
            config.instance_filter(),
            config.ip_order.clone(),
        ));
        let cache = Arc::new(AnswerCache::default());
        let invalidator = Arc::new(Invalidator::new(
            lookup.clone(),
            cache.clone(),
            DrainType::Batch,
            config.queue_capacity,
        ));
        let server = Server::new(&config, lookup, cache.clone(), Some(invalidator.clone()));
        Fixture {
            inventory,
            cache,
            invalidator,
            server,
        }
    }

    async fn ask(server: &Server, name: &str, qtype: RecordType) -> QueryState {
        let mut qstate = QueryState::new(QueryInfo::new(name, qtype));
        server.operate(ModuleEvent::New, &mut qstate).await;
        qstate
    }

    fn records(qstate: &QueryState) -> Vec<String> {
        qstate
            .return_msg
            .as_ref()
            .map(|a| a.records.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn answers_a_query_from_the_inventory() {
        let f = fixture(config(), vec![host1()]);
        let qstate = ask(&f.server, "host1.example.com.", RecordType::A).await;

        assert_eq!(qstate.ext_state, Some(ModuleState::Finished));
        assert_eq!(qstate.return_rcode, Some(Rcode::NoError));
        assert_eq!(records(&qstate), vec!["host1.example.com. 300 IN A 10.0.0.5"]);

        let key = qstate.qinfo.key();
        assert!(f.cache.get(&key).is_some());
        assert_eq!(f.invalidator.queue().len(), 1);
        let task = &f.invalidator.queue().tasks()[0];
        assert_eq!(task.query, key);
        assert!(task.instance_ids.contains("i-1"));
    }

    #[tokio::test]
    async fn any_queries_are_forwarded() {
        let f = fixture(config(), vec![host1()]);
        let qstate = ask(&f.server, "host1.example.com.", RecordType::Any).await;
        assert_eq!(records(&qstate), vec!["host1.example.com. 300 IN A 10.0.0.5"]);
    }

    #[tokio::test]
    async fn tag_address_beats_primary() {
        let instance = InstanceDescriptor::new("i-9")
            .with_tag(NAME_TAG, "host9.example.com")
            .with_tag(ADDRESS_TAG, "10.0.0.9")
            .with_primary(Ipv4Addr::new(10, 0, 0, 1));
        let f = fixture(config(), vec![instance]);
        let qstate = ask(&f.server, "host9.example.com.", RecordType::A).await;
        assert_eq!(records(&qstate), vec!["host9.example.com. 300 IN A 10.0.0.9"]);
    }

    #[tokio::test]
    async fn unknown_names_are_nxdomain() {
        let f = fixture(config(), vec![host1()]);
        let qstate = ask(&f.server, "nohost.example.com.", RecordType::A).await;

        assert_eq!(qstate.ext_state, Some(ModuleState::Finished));
        assert_eq!(qstate.return_rcode, Some(Rcode::NxDomain));
        assert!(records(&qstate).is_empty());
        // Tracked with an empty id set so a new instance drops the cached answer.
        assert_eq!(f.invalidator.queue().len(), 1);
    }

    #[tokio::test]
    async fn every_instance_answers_once() {
        let instances: Vec<_> = (1..=4)
            .map(|i| {
                InstanceDescriptor::new(format!("i-{}", i))
                    .with_tag(NAME_TAG, "web.example.com")
                    .with_primary(Ipv4Addr::new(10, 0, 1, i))
            })
            .collect();
        let f = fixture(config(), instances);

        let mut answers = records(&ask(&f.server, "web.example.com.", RecordType::A).await);
        answers.sort();
        let expected: Vec<String> = (1..=4)
            .map(|i| format!("web.example.com. 300 IN A 10.0.1.{}", i))
            .collect();
        assert_eq!(answers, expected);
    }

    #[tokio::test]
    async fn instances_without_addresses_are_skipped() {
        let bare = InstanceDescriptor::new("i-2").with_tag(NAME_TAG, "host1.example.com");
        let f = fixture(config(), vec![host1(), bare]);
        let qstate = ask(&f.server, "host1.example.com.", RecordType::A).await;

        assert_eq!(qstate.return_rcode, Some(Rcode::NoError));
        assert_eq!(records(&qstate), vec!["host1.example.com. 300 IN A 10.0.0.5"]);
        let task = &f.invalidator.queue().tasks()[0];
        assert_eq!(task.instance_ids.len(), 2);
    }

    #[tokio::test]
    async fn inventory_failure_fails_closed() {
        let f = fixture(config(), vec![host1()]);
        f.inventory.set_unavailable(true);
        let qstate = ask(&f.server, "host1.example.com.", RecordType::A).await;

        assert_eq!(qstate.ext_state, Some(ModuleState::Error));
        assert!(qstate.return_msg.is_none());
        assert!(f.cache.is_empty());
        assert!(f.invalidator.queue().is_empty());
    }

    #[tokio::test]
    async fn out_of_zone_and_other_types_pass_through() {
        let f = fixture(config(), vec![host1()]);

        let qstate = ask(&f.server, "host1.example.org.", RecordType::A).await;
        assert_eq!(qstate.ext_state, Some(ModuleState::WaitModule));

        let qstate = ask(&f.server, "host1.example.com.", RecordType::Txt).await;
        assert_eq!(qstate.ext_state, Some(ModuleState::WaitModule));
        assert!(qstate.return_msg.is_none());

        let mut qstate = QueryState::new(QueryInfo::new("host1.example.org.", RecordType::A));
        let state = f.server.operate(ModuleEvent::Pass, &mut qstate).await;
        assert_eq!(state, ModuleState::WaitModule);
    }

    #[tokio::test]
    async fn forwarded_subzones_pass_through() {
        let config = ServerConfig {
            forwarded_zones: vec!["corp.example.com.".into()],
            ..config()
        };
        let instance = InstanceDescriptor::new("i-3")
            .with_tag(NAME_TAG, "db.corp.example.com")
            .with_tag(ADDRESS_TAG, "10.0.0.3");
        let f = fixture(config, vec![instance]);

        let qstate = ask(&f.server, "db.corp.example.com.", RecordType::A).await;
        assert_eq!(qstate.ext_state, Some(ModuleState::WaitModule));
        assert!(f.invalidator.queue().is_empty());
    }

    #[tokio::test]
    async fn moddone_finishes_and_unknown_events_fail() {
        let f = fixture(config(), vec![host1()]);
        let mut qstate = QueryState::new(QueryInfo::new("host1.example.com.", RecordType::A));

        assert_eq!(
            f.server.operate(ModuleEvent::ModDone, &mut qstate).await,
            ModuleState::Finished
        );
        assert_eq!(
            f.server.operate(ModuleEvent::Other(7), &mut qstate).await,
            ModuleState::Error
        );
        assert_eq!(qstate.ext_state, Some(ModuleState::Error));
    }

    #[tokio::test]
    async fn reverse_queries_answer_with_hostnames() {
        let f = fixture(config(), vec![host1()]);
        let qstate = ask(&f.server, "5.0.0.10.in-addr.arpa.", RecordType::Ptr).await;
        assert_eq!(
            records(&qstate),
            vec!["5.0.0.10.in-addr.arpa. 300 IN PTR host1.example.com."]
        );

        let qstate = ask(&f.server, "6.0.0.10.in-addr.arpa.", RecordType::Ptr).await;
        assert_eq!(qstate.return_rcode, Some(Rcode::NxDomain));

        let qstate = ask(&f.server, "5.0.0.192.in-addr.arpa.", RecordType::Ptr).await;
        assert_eq!(qstate.ext_state, Some(ModuleState::WaitModule));
    }

    #[tokio::test]
    async fn authoritative_mode_skips_cache_and_queue() {
        let config = ServerConfig {
            server_mode: ServerMode::Authoritative,
            ..config()
        };
        let f = fixture(config, vec![host1()]);

        let qstate = ask(&f.server, "host1.example.com.", RecordType::A).await;
        let answer = qstate.return_msg.clone().unwrap();
        assert!(answer.authoritative);
        assert_eq!(answer.records.len(), 1);
        assert!(f.cache.is_empty());
        assert!(f.invalidator.queue().is_empty());

        // Other types in the zone are answered, without records.
        let qstate = ask(&f.server, "host1.example.com.", RecordType::Txt).await;
        assert_eq!(qstate.ext_state, Some(ModuleState::Finished));
        assert_eq!(qstate.return_rcode, Some(Rcode::NoError));
        assert!(records(&qstate).is_empty());
    }

    #[tokio::test]
    async fn authoritative_ptr_for_forward_name_has_no_records() {
        let config = ServerConfig {
            server_mode: ServerMode::Authoritative,
            ..config()
        };
        let f = fixture(config, vec![host1()]);

        let qstate = ask(&f.server, "host1.example.com.", RecordType::Ptr).await;
        assert_eq!(qstate.ext_state, Some(ModuleState::Finished));
        assert_eq!(qstate.return_rcode, Some(Rcode::NoError));
        assert!(records(&qstate).is_empty());

        // Reverse names still answer with hostnames.
        let qstate = ask(&f.server, "5.0.0.10.in-addr.arpa.", RecordType::Ptr).await;
        assert_eq!(
            records(&qstate),
            vec!["5.0.0.10.in-addr.arpa. 300 IN PTR host1.example.com."]
        );
    }

    #[tokio::test]
    async fn full_queue_still_answers() {
        let config = ServerConfig {
            queue_capacity: 1,
            ..config()
        };
        let f = fixture(config, vec![host1()]);

        ask(&f.server, "host1.example.com.", RecordType::A).await;
        let qstate = ask(&f.server, "host1.example.com.", RecordType::Any).await;
        assert_eq!(qstate.ext_state, Some(ModuleState::Finished));
        assert_eq!(records(&qstate).len(), 1);
        assert_eq!(f.invalidator.queue().len(), 1);
    }

    struct BrokenCache {
        stores: Mutex<usize>,
    }

    impl HostCache for BrokenCache {
        fn store(&self, _query: &crate::message::QueryKey, _answer: &Answer, _ttl: u32) -> Result<(), ResolverError> {
            *self.stores.lock().unwrap() += 1;
            Err(ResolverError::HostCache("out of memory".into()))
        }

        fn invalidate(&self, _query: &crate::message::QueryKey) -> Result<(), ResolverError> {
            Err(ResolverError::HostCache("out of memory".into()))
        }
    }

    #[tokio::test]
    async fn cache_store_failure_is_not_fatal() {
        let config = config();
        let inventory = Arc::new(StaticInventory::new(vec![host1()]));
        let lookup: Arc<dyn InstanceLookup> = Arc::new(CacheLookup::new(
            inventory,
            config.instance_filter(),
            config.ip_order.clone(),
        ));
        lookup.resolve().await.unwrap();
        let cache = Arc::new(BrokenCache {
            stores: Mutex::new(0),
        });
        let invalidator = Arc::new(Invalidator::new(lookup.clone(), cache.clone(), DrainType::Batch, 8));
        let server = Server::new(&config, lookup, cache.clone(), Some(invalidator.clone()));

        let qstate = ask(&server, "host1.example.com.", RecordType::A).await;
        assert_eq!(qstate.ext_state, Some(ModuleState::Finished));
        assert_eq!(records(&qstate).len(), 1);
        assert_eq!(*cache.stores.lock().unwrap(), 1);
        assert!(invalidator.queue().is_empty());
    }
}
