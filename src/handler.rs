//! Entry point for decoded client messages.
//!
//! The handler finds the link a message belongs to and runs the processor
//! for its type. Transport (sockets, relay encapsulation, wire encoding)
//! lives outside this crate; callers pass decoded messages in and send back
//! whatever reply comes out.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::error::Result;
use crate::link::Link;
use crate::message::{BOOTREQUEST, DhcpV4Message, DhcpV6Message, V4MessageType, V6MessageType};
use crate::processor::{execute, v4, v6};
use crate::store::IaStore;

pub struct MessageHandler<S> {
    context: Arc<ServerContext<S>>,
}

impl<S> Clone for MessageHandler<S> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
        }
    }
}

impl<S: IaStore> MessageHandler<S> {
    pub fn new(context: Arc<ServerContext<S>>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ServerContext<S> {
        &self.context
    }

    /// Handles a DHCPv6 client message and returns the reply to send.
    ///
    /// # Errors
    ///
    /// Returns an error when the lease store fails; no reply should be sent.
    pub async fn handle_v6(&self, request: &DhcpV6Message) -> Result<Option<DhcpV6Message>> {
        let client = request
            .client_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let Some(link) = self.v6_link(request) else {
            warn!("No link for {} from {}", request.msg_type, client);
            return Ok(None);
        };
        info!("{} from {} on {}", request.msg_type, client, link.name());

        let context = self.context.as_ref();
        match request.msg_type {
            V6MessageType::Solicit => {
                execute(v6::SolicitProcessor::new(context, request, link)).await
            }
            V6MessageType::Request => {
                execute(v6::RequestProcessor::new(context, request, link)).await
            }
            V6MessageType::Renew => execute(v6::RenewProcessor::new(context, request, link)).await,
            V6MessageType::Rebind => {
                execute(v6::RebindProcessor::new(context, request, link)).await
            }
            V6MessageType::Release => {
                execute(v6::ReleaseProcessor::release(context, request, link)).await
            }
            V6MessageType::Decline => {
                execute(v6::ReleaseProcessor::decline(context, request, link)).await
            }
            V6MessageType::Confirm => {
                execute(v6::ConfirmProcessor::new(context, request, link)).await
            }
            V6MessageType::InformationRequest => {
                execute(v6::InfoRequestProcessor::new(context, request, link)).await
            }
            other => {
                warn!("Ignoring {} message", other);
                Ok(None)
            }
        }
    }

    /// Handles a DHCPv4 client message and returns the reply to send.
    ///
    /// # Errors
    ///
    /// Returns an error when the lease store fails; no reply should be sent.
    pub async fn handle_v4(&self, request: &DhcpV4Message) -> Result<Option<DhcpV4Message>> {
        let mac = request.format_mac();
        if request.op != BOOTREQUEST {
            debug!("Ignoring BOOTREPLY from {}", mac);
            return Ok(None);
        }
        let Some(message_type) = request.message_type() else {
            warn!("BOOTP from {} is not supported", mac);
            return Ok(None);
        };
        let Some(link) = self.v4_link(request) else {
            warn!("No link for {} from {} (giaddr {})", message_type, mac, request.giaddr);
            return Ok(None);
        };
        info!("{} from {} on {}", message_type, mac, link.name());

        let context = self.context.as_ref();
        match message_type {
            V4MessageType::Discover => {
                execute(v4::DiscoverProcessor::new(context, request, link)).await
            }
            V4MessageType::Request => {
                execute(v4::RequestProcessor::new(context, request, link)).await
            }
            V4MessageType::Release => {
                execute(v4::ReleaseProcessor::new(context, request, link)).await
            }
            V4MessageType::Decline => {
                execute(v4::DeclineProcessor::new(context, request, link)).await
            }
            V4MessageType::Inform => {
                execute(v4::InformProcessor::new(context, request, link)).await
            }
            other => {
                warn!("Ignoring {} message", other);
                Ok(None)
            }
        }
    }

    /// Relayed messages are located by the relay's link address, direct ones
    /// go to the first IPv6 link.
    fn v6_link(&self, request: &DhcpV6Message) -> Option<Arc<Link>> {
        let links = self.context.links();
        match request.link_address.filter(|address| !address.is_unspecified()) {
            Some(address) => links.find_by_address(IpAddr::V6(address)),
            None => links.default_link(false),
        }
    }

    /// giaddr, then ciaddr, then the link holding the server address.
    fn v4_link(&self, request: &DhcpV4Message) -> Option<Arc<Link>> {
        let links = self.context.links();
        if !request.giaddr.is_unspecified() {
            return links.find_by_address(IpAddr::V4(request.giaddr));
        }
        if !request.ciaddr.is_unspecified()
            && let Some(link) = links.find_by_address(IpAddr::V4(request.ciaddr))
        {
            return Some(link);
        }
        links
            .find_by_address(IpAddr::V4(self.context.server_ipv4()))
            .or_else(|| links.default_link(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ddns::NoopDdns;
    use crate::message::{ClientId, IaOption};
    use crate::store::MemoryStore;
    use std::net::Ipv4Addr;

    async fn handler(config: Config) -> MessageHandler<MemoryStore> {
        let context = ServerContext::build(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(NoopDdns),
            None,
        )
        .await
        .unwrap();
        MessageHandler::new(Arc::new(context))
    }

    fn dual_stack() -> Config {
        serde_json::from_str(include_str!("../demos/dual-stack.json")).unwrap()
    }

    #[tokio::test]
    async fn test_v4_discover_on_default_link() {
        let handler = handler(Config::default()).await;
        let discover = DhcpV4Message::request(V4MessageType::Discover, [1, 2, 3, 4, 5, 6], 9);
        let offer = handler.handle_v4(&discover).await.unwrap().unwrap();
        assert_eq!(offer.message_type(), Some(V4MessageType::Offer));
        assert_eq!(offer.xid, 9);
    }

    #[tokio::test]
    async fn test_v4_unknown_relay_is_dropped() {
        let handler = handler(Config::default()).await;
        let mut discover = DhcpV4Message::request(V4MessageType::Discover, [1, 2, 3, 4, 5, 6], 9);
        discover.giaddr = Ipv4Addr::new(172, 16, 0, 1);
        assert!(handler.handle_v4(&discover).await.unwrap().is_none());

        let mut reply = DhcpV4Message::request(V4MessageType::Offer, [1, 2, 3, 4, 5, 6], 9);
        reply.op = crate::message::BOOTREPLY;
        assert!(handler.handle_v4(&reply).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_v4_bootp_is_ignored() {
        let handler = handler(Config::default()).await;
        let mut bootp = DhcpV4Message::request(V4MessageType::Discover, [1, 2, 3, 4, 5, 6], 9);
        bootp.options.clear();
        assert!(handler.handle_v4(&bootp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_v6_relayed_solicit_uses_link_address() {
        let handler = handler(dual_stack()).await;
        let mut solicit = DhcpV6Message::new(V6MessageType::Solicit, 0x42);
        solicit.client_id = Some(ClientId::new(vec![
            0, 3, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
        ]));
        solicit.ia_nas.push(IaOption::new(1));
        solicit.link_address = Some("2001:db8:1::2".parse().unwrap());

        let advertise = handler.handle_v6(&solicit).await.unwrap().unwrap();
        assert_eq!(advertise.msg_type, V6MessageType::Advertise);
        assert_eq!(advertise.link_address, solicit.link_address);
        let address = advertise.ia_nas[0].addresses[0].address;
        let link = handler.context().links().find_by_address(IpAddr::V6(address)).unwrap();
        assert_eq!(Some(link.subnet()), "2001:db8:1::/64".parse().ok());

        solicit.link_address = Some("2001:db8:ffff::1".parse().unwrap());
        assert!(handler.handle_v6(&solicit).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_v6_server_messages_are_ignored() {
        let handler = handler(dual_stack()).await;
        let mut advertise = DhcpV6Message::new(V6MessageType::Advertise, 1);
        advertise.client_id = Some(ClientId::new(vec![1, 2, 3]));
        assert!(handler.handle_v6(&advertise).await.unwrap().is_none());
    }
}
