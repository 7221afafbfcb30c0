//! DHCPv4 message processors (RFC 2131 §4.3).

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::binding::{Binding, BindingObjectOps};
use crate::context::ServerContext;
use crate::error::Result;
use crate::link::Link;
use crate::manager::ClientRequest;
use crate::message::{BOOTREQUEST, DhcpV4Message, V4MessageType};
use crate::options::{DhcpOption, V4OptionCode};
use crate::policy::Policy;
use crate::processor::MessageProcessor;
use crate::store::{IaKey, IaStore, IaType, LeaseState};

/// Options sent whether or not the client asked for them.
const ALWAYS_SENT: [u16; 5] = [53, 54, 51, 58, 59];

/// State shared by every v4 processor.
pub struct V4Exchange<'a, S> {
    context: &'a ServerContext<S>,
    request: &'a DhcpV4Message,
    link: Arc<Link>,
    client: ClientRequest,
    key: IaKey,
    mac: String,
    reply: Option<DhcpV4Message>,
}

impl<'a, S: IaStore> V4Exchange<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV4Message, link: Arc<Link>) -> Self {
        Self {
            context,
            request,
            link,
            client: ClientRequest::from_v4(request),
            key: IaKey::v4(request.client_id()),
            mac: request.format_mac(),
            reply: None,
        }
    }

    fn is_request(&self) -> bool {
        self.request.op == BOOTREQUEST
    }

    async fn current_binding(&self) -> Result<Option<Binding>> {
        self.context
            .manager(IaType::V4)
            .find_current_binding(&self.link, &self.key, &self.client)
            .await
    }

    /// Extends `binding` and returns it if it still holds `ip`.
    async fn commit(&self, binding: Binding, ip: Ipv4Addr) -> Result<Option<Binding>> {
        let updated = self
            .context
            .manager(IaType::V4)
            .update_binding(
                binding,
                &self.link,
                &[IpAddr::V4(ip)],
                &self.client,
                LeaseState::Committed,
            )
            .await?;
        Ok(updated.filter(|binding| binding.has_address(IpAddr::V4(ip))))
    }

    /// Builds an Offer or Ack for the first address of `binding`.
    fn lease_reply(&mut self, message_type: V4MessageType, binding: &Binding) -> Option<Ipv4Addr> {
        let object = binding.objects.first()?;
        let IpAddr::V4(ip) = object.ip() else {
            return None;
        };
        let times = self
            .context
            .manager(IaType::V4)
            .lease_times(&self.link, object.owner(), &self.client);

        let mut options = vec![
            self.server_identifier(),
            DhcpOption::u32_value(V4OptionCode::LeaseTime.into(), times.valid),
            DhcpOption::u32_value(V4OptionCode::RenewalTime.into(), times.t1),
            DhcpOption::u32_value(V4OptionCode::RebindingTime.into(), times.t2),
        ];
        options.extend(self.context.reply_options(
            &self.client,
            Some(object.owner().policy_level()),
            &self.link,
        ));
        self.reply = Some(self.build_reply(message_type, ip, options));
        Some(ip)
    }

    fn nak(&mut self, reason: &str) {
        let options = vec![self.server_identifier()];
        self.reply = Some(self.build_reply(V4MessageType::Nak, Ipv4Addr::UNSPECIFIED, options));
        warn!("NAK to {}: {}", self.mac, reason);
    }

    fn server_identifier(&self) -> DhcpOption {
        DhcpOption::new(
            V4OptionCode::ServerIdentifier.into(),
            self.context.server_ipv4().octets(),
        )
    }

    /// Filters `options` by the parameter request list and echoes the
    /// relay agent information.
    fn build_reply(
        &self,
        message_type: V4MessageType,
        your_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> DhcpV4Message {
        let mut options = match self.request.parameter_request_list() {
            Some(prl) => options
                .into_iter()
                .filter(|option| {
                    ALWAYS_SENT.contains(&option.code)
                        || prl.iter().any(|code| u16::from(*code) == option.code)
                })
                .collect(),
            None => options,
        };
        if let Some(relay_info) = self.request.option(V4OptionCode::RelayAgentInfo) {
            options.push(relay_info.clone());
        }
        DhcpV4Message::create_reply(
            self.request,
            message_type,
            your_ip,
            self.context.server_ipv4(),
            options,
        )
    }
}

/// Discover: offer an address, or commit it straight away with Rapid
/// Commit (RFC 4039).
pub struct DiscoverProcessor<'a, S> {
    exchange: V4Exchange<'a, S>,
}

impl<'a, S: IaStore> DiscoverProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV4Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V4Exchange::new(context, request, link),
        }
    }
}

impl<S: IaStore> MessageProcessor for DiscoverProcessor<'_, S> {
    type Reply = DhcpV4Message;

    fn pre_process(&self) -> bool {
        self.exchange.is_request()
    }

    async fn process(&mut self) -> Result<bool> {
        let exchange = &mut self.exchange;
        let rapid_commit = exchange.request.rapid_commit()
            && exchange
                .context
                .link_flag(&exchange.client, &exchange.link, Policy::SupportRapidCommit);
        let state = if rapid_commit {
            LeaseState::Committed
        } else {
            LeaseState::Advertised
        };
        let hints: Vec<IpAddr> = exchange
            .request
            .requested_ip()
            .map(IpAddr::V4)
            .into_iter()
            .collect();

        let manager = exchange.context.manager(IaType::V4);
        let binding = match exchange.current_binding().await? {
            Some(current) => {
                manager
                    .update_binding(current, &exchange.link, &hints, &exchange.client, state)
                    .await?
            }
            None => {
                manager
                    .create_binding(&exchange.link, &exchange.key, &hints, &exchange.client, state)
                    .await?
            }
        };
        let Some(binding) = binding else {
            warn!("Pool exhausted, cannot offer IP to {}", exchange.mac);
            return Ok(false);
        };

        let message_type = if rapid_commit {
            V4MessageType::Ack
        } else {
            V4MessageType::Offer
        };
        let Some(ip) = exchange.lease_reply(message_type, &binding) else {
            return Ok(false);
        };
        if rapid_commit && let Some(reply) = exchange.reply.as_mut() {
            reply
                .options
                .push(DhcpOption::flag(V4OptionCode::RapidCommit.into()));
        }
        info!("{} {} to {}", message_type, ip, exchange.mac);
        Ok(true)
    }

    fn into_reply(self) -> Option<DhcpV4Message> {
        self.exchange.reply
    }
}

/// Request, in the SELECTING, INIT-REBOOT, RENEWING and REBINDING states.
pub struct RequestProcessor<'a, S> {
    exchange: V4Exchange<'a, S>,
}

impl<'a, S: IaStore> RequestProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV4Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V4Exchange::new(context, request, link),
        }
    }

    async fn ack(&mut self, ip: Ipv4Addr) -> Result<bool> {
        let exchange = &mut self.exchange;
        let current = exchange
            .current_binding()
            .await?
            .filter(|binding| binding.has_address(IpAddr::V4(ip)));
        let committed = match current {
            Some(binding) => exchange.commit(binding, ip).await?,
            None => None,
        };
        match committed {
            Some(binding) => {
                exchange.lease_reply(V4MessageType::Ack, &binding);
                let lease = exchange
                    .reply
                    .as_ref()
                    .and_then(|reply| reply.option(V4OptionCode::LeaseTime))
                    .and_then(DhcpOption::as_u32)
                    .unwrap_or_default();
                info!("ACK {} to {} (lease: {} seconds)", ip, exchange.mac, lease);
            }
            None => exchange.nak("No binding for requested address"),
        }
        Ok(true)
    }
}

impl<S: IaStore> MessageProcessor for RequestProcessor<'_, S> {
    type Reply = DhcpV4Message;

    fn pre_process(&self) -> bool {
        let request = self.exchange.request;
        self.exchange.is_request()
            && (request.requested_ip().is_some() || request.ciaddr != Ipv4Addr::UNSPECIFIED)
    }

    async fn process(&mut self) -> Result<bool> {
        let request = self.exchange.request;

        if let Some(server_id) = request.server_identifier() {
            if server_id != self.exchange.context.server_ipv4() {
                info!("REQUEST from {} is for different server {}", self.exchange.mac, server_id);
                return Ok(false);
            }
            let Some(ip) = request.requested_ip() else {
                debug!("SELECTING REQUEST from {} without a requested address", self.exchange.mac);
                return Ok(false);
            };
            return self.ack(ip).await;
        }

        if request.ciaddr == Ipv4Addr::UNSPECIFIED {
            let Some(ip) = request.requested_ip() else {
                return Ok(false);
            };
            if !self.exchange.link.contains(IpAddr::V4(ip)) {
                self.exchange.nak("Requested address not on link");
                return Ok(true);
            }
            let known = self
                .exchange
                .current_binding()
                .await?
                .is_some_and(|binding| binding.has_address(IpAddr::V4(ip)));
            if !known {
                debug!("INIT-REBOOT from {} for unknown {}", self.exchange.mac, ip);
                return Ok(false);
            }
            return self.ack(ip).await;
        }

        self.ack(request.ciaddr).await
    }

    fn into_reply(self) -> Option<DhcpV4Message> {
        self.exchange.reply
    }
}

/// Release: return the address in ciaddr. Never replied to.
pub struct ReleaseProcessor<'a, S> {
    exchange: V4Exchange<'a, S>,
}

impl<'a, S: IaStore> ReleaseProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV4Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V4Exchange::new(context, request, link),
        }
    }
}

impl<S: IaStore> MessageProcessor for ReleaseProcessor<'_, S> {
    type Reply = DhcpV4Message;

    fn pre_process(&self) -> bool {
        if self.exchange.request.ciaddr == Ipv4Addr::UNSPECIFIED {
            warn!("RELEASE from {} with no ciaddr", self.exchange.mac);
            return false;
        }
        self.exchange.is_request()
    }

    async fn process(&mut self) -> Result<bool> {
        let exchange = &self.exchange;
        let ip = IpAddr::V4(exchange.request.ciaddr);
        let Some(binding) = exchange.current_binding().await? else {
            debug!("RELEASE from {} for {} without a binding", exchange.mac, ip);
            return Ok(false);
        };
        if let Some(object) = binding.object(ip) {
            exchange
                .context
                .manager(IaType::V4)
                .release_ia_address(&binding, object)
                .await?;
            info!("RELEASE from {} for {}", exchange.mac, ip);
        }
        Ok(false)
    }

    fn into_reply(self) -> Option<DhcpV4Message> {
        self.exchange.reply
    }
}

/// Decline: the client found the requested address in use. Never replied
/// to.
pub struct DeclineProcessor<'a, S> {
    exchange: V4Exchange<'a, S>,
}

impl<'a, S: IaStore> DeclineProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV4Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V4Exchange::new(context, request, link),
        }
    }
}

impl<S: IaStore> MessageProcessor for DeclineProcessor<'_, S> {
    type Reply = DhcpV4Message;

    fn pre_process(&self) -> bool {
        self.exchange.is_request() && self.exchange.request.requested_ip().is_some()
    }

    async fn process(&mut self) -> Result<bool> {
        let exchange = &self.exchange;
        let Some(declined) = exchange.request.requested_ip() else {
            return Ok(false);
        };
        let ip = IpAddr::V4(declined);
        let binding = exchange.current_binding().await?;
        match binding
            .as_ref()
            .and_then(|binding| binding.object(ip).map(|object| (binding, object)))
        {
            Some((binding, object)) => {
                exchange
                    .context
                    .manager(IaType::V4)
                    .decline_ia_address(binding, object)
                    .await?;
                warn!("DECLINE from {} for {} - marked IP as unavailable", exchange.mac, ip);
            }
            None => warn!(
                "DECLINE from {} for {} rejected - IP not associated with this client",
                exchange.mac, ip
            ),
        }
        Ok(false)
    }

    fn into_reply(self) -> Option<DhcpV4Message> {
        self.exchange.reply
    }
}

/// Inform: configuration for a client that already has an address.
pub struct InformProcessor<'a, S> {
    exchange: V4Exchange<'a, S>,
}

impl<'a, S: IaStore> InformProcessor<'a, S> {
    pub fn new(context: &'a ServerContext<S>, request: &'a DhcpV4Message, link: Arc<Link>) -> Self {
        Self {
            exchange: V4Exchange::new(context, request, link),
        }
    }
}

impl<S: IaStore> MessageProcessor for InformProcessor<'_, S> {
    type Reply = DhcpV4Message;

    fn pre_process(&self) -> bool {
        self.exchange.is_request()
    }

    async fn process(&mut self) -> Result<bool> {
        let exchange = &mut self.exchange;
        let mut options = vec![exchange.server_identifier()];
        options.extend(
            exchange
                .context
                .reply_options(&exchange.client, None, &exchange.link),
        );
        exchange.reply = Some(exchange.build_reply(
            V4MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            options,
        ));
        info!("INFORM response to {}", exchange.mac);
        Ok(true)
    }

    fn into_reply(self) -> Option<DhcpV4Message> {
        self.exchange.reply
    }
}
