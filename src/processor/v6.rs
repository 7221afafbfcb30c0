//! DHCPv6 message processors (RFC 8415 §18.3).

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::binding::{Binding, BindingObject, BindingObjectOps};
use crate::context::ServerContext;
use crate::error::Result;
use crate::link::Link;
use crate::manager::ClientRequest;
use crate::message::{
    ClientId, DhcpV6Message, IaAddressOption, IaOption, IaPrefixOption, V6MessageType,
};
use crate::options::{DhcpOption, StatusCode, StatusOption, V6OptionCode, server_unicast_option};
use crate::policy::{Policy, PolicyLevel};
use crate::processor::MessageProcessor;
use crate::store::{IaKey, IaStore, IaType, LeaseState};

/// State shared by every v6 processor: the request, the link it arrived on
/// and the reply being built.
pub struct V6Exchange<'a, S> {
    context: &'a ServerContext<S>,
    request: &'a DhcpV6Message,
    link: Arc<Link>,
    client: ClientRequest,
    reply: DhcpV6Message,
    /// Options of the first pool or reservation that bound an object.
    pool_level: Option<PolicyLevel>,
}

impl<'a, S: IaStore> V6Exchange<'a, S> {
    pub fn new(
        context: &'a ServerContext<S>,
        request: &'a DhcpV6Message,
        link: Arc<Link>,
        reply_type: V6MessageType,
    ) -> Self {
        Self {
            context,
            request,
            link,
            client: ClientRequest::from_v6(request),
            reply: DhcpV6Message::reply_to(request, reply_type, context.server_id().clone()),
            pool_level: None,
        }
    }

    fn has_client_id(&self) -> bool {
        self.request
            .client_id
            .as_ref()
            .is_some_and(|id| !id.is_empty())
    }

    fn server_id_matches(&self) -> bool {
        self.request.server_id.as_ref() == Some(self.context.server_id())
    }

    /// Unicast is only accepted where the link grants `server_unicast`.
    fn unicast_allowed(&self) -> bool {
        !self.request.is_unicast()
            || self
                .context
                .link_flag(&self.client, &self.link, Policy::ServerUnicast)
    }

    /// Replaces the reply with one carrying only a UseMulticast status and
    /// the two DUIDs.
    fn use_multicast(&mut self) {
        let mut reply = DhcpV6Message::reply_to(
            self.request,
            V6MessageType::Reply,
            self.context.server_id().clone(),
        );
        reply.status = Some(StatusOption::new(
            StatusCode::UseMulticast,
            "Unicast not allowed on this link",
        ));
        self.reply = reply;
        info!(
            "{} from {} sent unicast, replying UseMulticast",
            self.request.msg_type,
            self.client_label()
        );
    }

    fn client_label(&self) -> String {
        self.request
            .client_id
            .as_ref()
            .map(ClientId::to_string)
            .unwrap_or_default()
    }

    fn key(&self, ia_type: IaType, iaid: u32) -> IaKey {
        let client_id = self
            .request
            .client_id
            .clone()
            .unwrap_or_else(|| ClientId::new(Vec::new()));
        IaKey::new(client_id, ia_type, iaid)
    }

    /// Finds or creates the binding for one IA. Exhaustion is reported in
    /// the IA's status.
    async fn assign(
        &mut self,
        ia_type: IaType,
        ia: &IaOption,
        state: LeaseState,
    ) -> Result<IaOption> {
        let key = self.key(ia_type, ia.iaid);
        let manager = self.context.manager(ia_type);
        let hints = ia.hinted_addresses();

        let binding = match manager
            .find_current_binding(&self.link, &key, &self.client)
            .await?
        {
            Some(current) => {
                manager
                    .update_binding(current, &self.link, &hints, &self.client, state)
                    .await?
            }
            None => {
                manager
                    .create_binding(&self.link, &key, &hints, &self.client, state)
                    .await?
            }
        };

        Ok(match binding {
            Some(binding) => self.ia_from_binding(ia_type, ia.iaid, &binding),
            None => exhausted(ia_type, ia.iaid),
        })
    }

    /// Extends an existing binding for Renew and Rebind.
    async fn extend(&mut self, ia_type: IaType, ia: &IaOption, rebind: bool) -> Result<IaOption> {
        let key = self.key(ia_type, ia.iaid);
        let manager = self.context.manager(ia_type);
        let hints = ia.hinted_addresses();

        let Some(current) = manager
            .find_current_binding(&self.link, &key, &self.client)
            .await?
        else {
            let link = Arc::clone(&self.link);
            if rebind && hints.iter().any(|ip| !link.contains(*ip)) {
                let mut reply = IaOption::new(ia.iaid);
                echo_zero_lifetimes(ia, &mut reply, |ip| !link.contains(ip));
                return Ok(reply);
            }
            debug!("No binding for {}", key);
            return Ok(IaOption::with_status(
                ia.iaid,
                StatusOption::new(StatusCode::NoBinding, "No binding for IA"),
            ));
        };

        let updated = manager
            .update_binding(current, &self.link, &hints, &self.client, LeaseState::Committed)
            .await?;
        Ok(match updated {
            Some(binding) => {
                let mut reply = self.ia_from_binding(ia_type, ia.iaid, &binding);
                echo_zero_lifetimes(ia, &mut reply, |ip| !binding.has_address(ip));
                reply
            }
            None => exhausted(ia_type, ia.iaid),
        })
    }

    /// Releases or declines the objects of one IA. Returns an IA only when
    /// there is nothing to act on.
    async fn relinquish(
        &mut self,
        ia_type: IaType,
        ia: &IaOption,
        decline: bool,
    ) -> Result<Option<IaOption>> {
        let key = self.key(ia_type, ia.iaid);
        let manager = self.context.manager(ia_type);
        let no_binding = || {
            IaOption::with_status(
                ia.iaid,
                StatusOption::new(StatusCode::NoBinding, "No binding for IA"),
            )
        };

        let Some(binding) = manager
            .find_current_binding(&self.link, &key, &self.client)
            .await?
        else {
            return Ok(Some(no_binding()));
        };

        let listed = ia.hinted_addresses();
        let targets: Vec<&BindingObject> = binding
            .objects
            .iter()
            .filter(|object| listed.is_empty() || listed.contains(&object.ip()))
            .collect();
        if targets.is_empty() {
            return Ok(Some(no_binding()));
        }

        for object in targets {
            if decline {
                manager.decline_ia_address(&binding, object).await?;
            } else {
                manager.release_ia_address(&binding, object).await?;
            }
        }
        Ok(None)
    }

    /// Builds the reply IA for a binding with the lifetimes its owners grant.
    fn ia_from_binding(&mut self, ia_type: IaType, iaid: u32, binding: &Binding) -> IaOption {
        let manager = self.context.manager(ia_type);
        let mut reply = IaOption::new(iaid);
        let mut timers: Option<(u32, u32)> = None;

        for object in &binding.objects {
            let IpAddr::V6(address) = object.ip() else {
                continue;
            };
            let times = manager.lease_times(&binding.link, object.owner(), &self.client);
            match object {
                BindingObject::Address(_) => reply.addresses.push(IaAddressOption {
                    preferred_lifetime: times.preferred,
                    valid_lifetime: times.valid,
                    ..IaAddressOption::new(address)
                }),
                BindingObject::Prefix(prefix) => reply.prefixes.push(IaPrefixOption {
                    preferred_lifetime: times.preferred,
                    valid_lifetime: times.valid,
                    ..IaPrefixOption::new(address, prefix.prefix_length())
                }),
            }
            timers = Some(match timers {
                Some((t1, t2)) => (t1.min(times.t1), t2.min(times.t2)),
                None => (times.t1, times.t2),
            });
            if self.pool_level.is_none() {
                self.pool_level = Some(object.owner().policy_level().clone());
            }
        }

        if ia_type != IaType::Ta
            && let Some((t1, t2)) = timers
        {
            reply.t1 = t1;
            reply.t2 = t2;
        }
        reply
    }

    /// Adds configured options, filtered by the client's Option Request
    /// option when it sent one.
    fn finish(&mut self) {
        let mut options = self.context.reply_options(
            &self.client,
            self.pool_level.as_ref(),
            &self.link,
        );
        let requested = self.request.requested_option_codes();
        if !requested.is_empty() {
            options.retain(|option| requested.contains(&option.code));
        }
        if let Some(address) = self.context.config().server_ipv6
            && self
                .context
                .link_flag(&self.client, &self.link, Policy::ServerUnicast)
        {
            options.push(server_unicast_option(address));
        }
        self.reply.options.extend(options);
    }
}

fn exhausted(ia_type: IaType, iaid: u32) -> IaOption {
    let status = if ia_type == IaType::Pd {
        StatusOption::new(StatusCode::NoPrefixAvail, "No prefixes available")
    } else {
        StatusOption::new(StatusCode::NoAddrsAvail, "No addresses available")
    };
    IaOption::with_status(iaid, status)
}

/// Copies the requested addresses and prefixes selected by `keep` into
/// `reply` with zero lifetimes.
fn echo_zero_lifetimes(request: &IaOption, reply: &mut IaOption, keep: impl Fn(IpAddr) -> bool) {
    for address in &request.addresses {
        if keep(IpAddr::V6(address.address)) {
            reply.addresses.push(IaAddressOption::new(address.address));
        }
    }
    for prefix in &request.prefixes {
        if keep(IpAddr::V6(prefix.prefix)) {
            reply
                .prefixes
                .push(IaPrefixOption::new(prefix.prefix, prefix.prefix_length));
        }
    }
}

fn push_ia(reply: &mut DhcpV6Message, ia_type: IaType, ia: IaOption) {
    match ia_type {
        IaType::Na => reply.ia_nas.push(ia),
        IaType::Ta => reply.ia_tas.push(ia),
        IaType::Pd => reply.ia_pds.push(ia),
        IaType::V4 => {}
    }
}

/// Every IA in `request` paired with its type.
fn ias(request: &DhcpV6Message) -> impl Iterator<Item = (IaType, &IaOption)> {
    request
        .ia_nas
        .iter()
        .map(|ia| (IaType::Na, ia))
        .chain(request.ia_tas.iter().map(|ia| (IaType::Ta, ia)))
        .chain(request.ia_pds.iter().map(|ia| (IaType::Pd, ia)))
}

/// Solicit: advertise bindings, or commit them with Rapid Commit.
pub struct SolicitProcessor<'a, S> {
    exchange: V6Exchange<'a, S>,
    rapid_commit: bool,
}

impl<'a, S: IaStore> SolicitProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV6Message, link: Arc<Link>) -> Self {
        let client = ClientRequest::from_v6(request);
        let rapid_commit = request.rapid_commit()
            && context.link_flag(&client, &link, Policy::SupportRapidCommit);
        let reply_type = if rapid_commit {
            V6MessageType::Reply
        } else {
            V6MessageType::Advertise
        };
        Self {
            exchange: V6Exchange::new(context, request, link, reply_type),
            rapid_commit,
        }
    }
}

impl<S: IaStore> MessageProcessor for SolicitProcessor<'_, S> {
    type Reply = DhcpV6Message;

    fn pre_process(&self) -> bool {
        if self.exchange.request.server_id.is_some() {
            debug!("SOLICIT with a server id, discarding");
            return false;
        }
        self.exchange.has_client_id()
    }

    async fn process(&mut self) -> Result<bool> {
        let state = if self.rapid_commit {
            LeaseState::Committed
        } else {
            LeaseState::Advertised
        };
        let request = self.exchange.request;
        for (ia_type, ia) in ias(request) {
            let reply_ia = self.exchange.assign(ia_type, ia, state).await?;
            push_ia(&mut self.exchange.reply, ia_type, reply_ia);
        }
        if self.rapid_commit {
            self.exchange
                .reply
                .options
                .push(DhcpOption::flag(V6OptionCode::RapidCommit.into()));
        }
        self.exchange.finish();
        info!(
            "{} to {} on {}",
            self.exchange.reply.msg_type,
            self.exchange.client_label(),
            self.exchange.link.name()
        );
        Ok(true)
    }

    fn into_reply(self) -> Option<DhcpV6Message> {
        Some(self.exchange.reply)
    }
}

/// Request: commit the client's chosen bindings.
pub struct RequestProcessor<'a, S> {
    exchange: V6Exchange<'a, S>,
}

impl<'a, S: IaStore> RequestProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV6Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V6Exchange::new(context, request, link, V6MessageType::Reply),
        }
    }
}

impl<S: IaStore> MessageProcessor for RequestProcessor<'_, S> {
    type Reply = DhcpV6Message;

    fn pre_process(&self) -> bool {
        self.exchange.server_id_matches() && self.exchange.has_client_id()
    }

    async fn process(&mut self) -> Result<bool> {
        if !self.exchange.unicast_allowed() {
            self.exchange.use_multicast();
            return Ok(true);
        }
        let request = self.exchange.request;
        for (ia_type, ia) in ias(request) {
            let reply_ia = self
                .exchange
                .assign(ia_type, ia, LeaseState::Committed)
                .await?;
            push_ia(&mut self.exchange.reply, ia_type, reply_ia);
        }
        self.exchange.finish();
        info!("REPLY to {} on {}", self.exchange.client_label(), self.exchange.link.name());
        Ok(true)
    }

    fn into_reply(self) -> Option<DhcpV6Message> {
        Some(self.exchange.reply)
    }
}

/// Renew: extend bindings with this server. IA_TAs are not renewed.
pub struct RenewProcessor<'a, S> {
    exchange: V6Exchange<'a, S>,
}

impl<'a, S: IaStore> RenewProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV6Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V6Exchange::new(context, request, link, V6MessageType::Reply),
        }
    }
}

impl<S: IaStore> MessageProcessor for RenewProcessor<'_, S> {
    type Reply = DhcpV6Message;

    fn pre_process(&self) -> bool {
        self.exchange.server_id_matches() && self.exchange.has_client_id()
    }

    async fn process(&mut self) -> Result<bool> {
        if !self.exchange.unicast_allowed() {
            self.exchange.use_multicast();
            return Ok(true);
        }
        let request = self.exchange.request;
        for (ia_type, ia) in ias(request).filter(|(ia_type, _)| *ia_type != IaType::Ta) {
            let reply_ia = self.exchange.extend(ia_type, ia, false).await?;
            push_ia(&mut self.exchange.reply, ia_type, reply_ia);
        }
        self.exchange.finish();
        info!("RENEW reply to {}", self.exchange.client_label());
        Ok(true)
    }

    fn into_reply(self) -> Option<DhcpV6Message> {
        Some(self.exchange.reply)
    }
}

/// Rebind: extend bindings made by any server.
pub struct RebindProcessor<'a, S> {
    exchange: V6Exchange<'a, S>,
}

impl<'a, S: IaStore> RebindProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV6Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V6Exchange::new(context, request, link, V6MessageType::Reply),
        }
    }
}

impl<S: IaStore> MessageProcessor for RebindProcessor<'_, S> {
    type Reply = DhcpV6Message;

    fn pre_process(&self) -> bool {
        self.exchange.request.server_id.is_none() && self.exchange.has_client_id()
    }

    async fn process(&mut self) -> Result<bool> {
        let request = self.exchange.request;
        for (ia_type, ia) in ias(request) {
            let reply_ia = self.exchange.extend(ia_type, ia, true).await?;
            push_ia(&mut self.exchange.reply, ia_type, reply_ia);
        }
        self.exchange.finish();
        info!("REBIND reply to {}", self.exchange.client_label());
        Ok(true)
    }

    fn into_reply(self) -> Option<DhcpV6Message> {
        Some(self.exchange.reply)
    }
}

/// Release and Decline share everything but the transition applied.
pub struct ReleaseProcessor<'a, S> {
    exchange: V6Exchange<'a, S>,
    decline: bool,
}

impl<'a, S: IaStore> ReleaseProcessor<'a, S> {
    pub fn release(
        context: &'a ServerContext<S>,
        request: &'a DhcpV6Message,
        link: Arc<Link>,
    ) -> Self {
        Self {
            exchange: V6Exchange::new(context, request, link, V6MessageType::Reply),
            decline: false,
        }
    }

    pub fn decline(
        context: &'a ServerContext<S>,
        request: &'a DhcpV6Message,
        link: Arc<Link>,
    ) -> Self {
        Self {
            exchange: V6Exchange::new(context, request, link, V6MessageType::Reply),
            decline: true,
        }
    }
}

impl<S: IaStore> MessageProcessor for ReleaseProcessor<'_, S> {
    type Reply = DhcpV6Message;

    fn pre_process(&self) -> bool {
        self.exchange.server_id_matches()
            && self.exchange.has_client_id()
            && self.exchange.request.has_ias()
    }

    async fn process(&mut self) -> Result<bool> {
        if !self.exchange.unicast_allowed() {
            self.exchange.use_multicast();
            return Ok(true);
        }
        let request = self.exchange.request;
        for (ia_type, ia) in ias(request) {
            if let Some(reply_ia) = self
                .exchange
                .relinquish(ia_type, ia, self.decline)
                .await?
            {
                push_ia(&mut self.exchange.reply, ia_type, reply_ia);
            }
        }
        let (message, verb) = if self.decline {
            ("Decline received", "DECLINE")
        } else {
            ("Release received", "RELEASE")
        };
        self.exchange.reply.status = Some(StatusOption::new(StatusCode::Success, message));
        info!("{} from {}", verb, self.exchange.client_label());
        Ok(true)
    }

    fn into_reply(self) -> Option<DhcpV6Message> {
        Some(self.exchange.reply)
    }
}

/// Confirm: tell a client whether its addresses still suit the link.
pub struct ConfirmProcessor<'a, S> {
    exchange: V6Exchange<'a, S>,
}

impl<'a, S: IaStore> ConfirmProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV6Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V6Exchange::new(context, request, link, V6MessageType::Reply),
        }
    }

    fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        let request = self.exchange.request;
        request
            .ia_nas
            .iter()
            .chain(&request.ia_tas)
            .flat_map(|ia| ia.addresses.iter().map(|addr| IpAddr::V6(addr.address)))
    }
}

impl<S: IaStore> MessageProcessor for ConfirmProcessor<'_, S> {
    type Reply = DhcpV6Message;

    fn pre_process(&self) -> bool {
        self.exchange.request.server_id.is_none()
            && self.exchange.has_client_id()
            && self.addresses().next().is_some()
    }

    async fn process(&mut self) -> Result<bool> {
        let off_link = self
            .addresses()
            .find(|ip| !self.exchange.link.contains(*ip));
        let status = match off_link {
            Some(ip) => {
                warn!(
                    "CONFIRM from {}: {} not on link {}",
                    self.exchange.client_label(),
                    ip,
                    self.exchange.link.name()
                );
                StatusOption::new(StatusCode::NotOnLink, "Address not on link")
            }
            None => StatusOption::new(StatusCode::Success, "All addresses on link"),
        };
        self.exchange.reply.status = Some(status);
        self.exchange.finish();
        Ok(true)
    }

    fn into_reply(self) -> Option<DhcpV6Message> {
        Some(self.exchange.reply)
    }
}

/// Information-Request: configuration only, no bindings.
pub struct InfoRequestProcessor<'a, S> {
    exchange: V6Exchange<'a, S>,
}

impl<'a, S: IaStore> InfoRequestProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV6Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V6Exchange::new(context, request, link, V6MessageType::Reply),
        }
    }
}

impl<S: IaStore> MessageProcessor for InfoRequestProcessor<'_, S> {
    type Reply = DhcpV6Message;

    fn pre_process(&self) -> bool {
        let request = self.exchange.request;
        !request.has_ias() && (request.server_id.is_none() || self.exchange.server_id_matches())
    }

    async fn process(&mut self) -> Result<bool> {
        self.exchange.finish();
        debug!("INFORMATION-REQUEST reply to {}", self.exchange.client_label());
        Ok(true)
    }

    fn into_reply(self) -> Option<DhcpV6Message> {
        Some(self.exchange.reply)
    }
}
