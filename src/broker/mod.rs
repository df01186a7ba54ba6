//! Broker core
//!
//! The composition root. The transport hands decoded messages in with the
//! session they arrived on; the core consults the topic matcher, delivery
//! tracker and session registry, and hands back the list of outbound
//! actions for the transport to encode and write.
//!
//! Per-session ordering is the transport's responsibility (one logical
//! worker per connection); the tables themselves are safe under concurrent
//! calls from different sessions' workers.

mod error;

pub use error::CoreError;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::delivery::DeliveryTracker;
use crate::identity::DeviceIdentity;
use crate::protocol::{
    ConnAck, Connect, ConnectCode, Message, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck,
    Subscribe, SubscribeReturn, UnsubAck, Unsubscribe,
};
use crate::routing::{ConnId, Session, SessionIndex, SessionKind, SessionRegistry, INVALID_INDEX};
use crate::topic::{validate_topic, TopicMatcher};

/// Outbound work produced by one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send to the originating connection
    Reply(Message),
    /// Send to another session, addressed by index
    Send {
        index: SessionIndex,
        message: Message,
    },
    /// Close a different connection (displaced by re-login)
    CloseConnection(ConnId),
    /// Close the originating connection after any queued replies
    Close,
}

/// The broker's subscription/delivery engine
///
/// Owns the three tables exclusively; transport sessions are referenced by
/// index, never owned. Constructed per broker instance so tests get
/// isolated state.
pub struct BrokerCore {
    matcher: TopicMatcher,
    tracker: DeliveryTracker,
    registry: SessionRegistry,
    identity: Arc<dyn DeviceIdentity>,
}

impl BrokerCore {
    pub fn new(config: CoreConfig, identity: Arc<dyn DeviceIdentity>) -> Self {
        Self {
            matcher: TopicMatcher::new(),
            tracker: DeliveryTracker::new(config.read_timeout, config.max_inflight),
            registry: SessionRegistry::new(),
            identity,
        }
    }

    pub fn matcher(&self) -> &TopicMatcher {
        &self.matcher
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Track a freshly accepted transport connection
    ///
    /// The session stays unaddressable until its CONNECT is handled.
    pub fn accept(&self, conn_id: ConnId, kind: SessionKind, multi_bind: bool) -> Arc<Session> {
        let session = Arc::new(Session::new(conn_id, kind, multi_bind));
        self.registry.register_session(&session);
        debug!(conn_id, ?kind, "connection accepted");
        session
    }

    /// Bind a cluster peer connection to an index and its routing prefixes
    ///
    /// Returns a displaced session the caller must close, if any.
    pub fn attach_peer(
        &self,
        session: &Arc<Session>,
        index: SessionIndex,
        prefixes: &[u64],
    ) -> Option<Arc<Session>> {
        self.registry.map_session(index, session, prefixes)
    }

    /// Dispatch one decoded inbound message
    ///
    /// An error means the originating connection must be closed; all other
    /// failure modes are local (logged, per-recipient drops) and do not
    /// stop processing.
    pub fn handle(
        &self,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<Vec<Action>, CoreError> {
        match message {
            Message::Connect(connect) => self.handle_connect(session, connect),
            Message::PingReq => Ok(vec![Action::Reply(Message::PingResp)]),
            Message::Disconnect => Ok(vec![Action::Close]),
            _ if !session.is_connected() => Err(CoreError::NotConnected),
            Message::Publish(publish) => self.handle_publish(session, publish),
            Message::PubAck(ack) => {
                self.tracker.ack(session.index(), ack.message_id);
                Ok(Vec::new())
            }
            Message::PubRec(rec) => self.handle_pubrec(session, rec),
            Message::PubRel(rel) => self.handle_pubrel(session, rel),
            Message::PubComp(comp) => {
                self.tracker.ack(session.index(), comp.message_id);
                Ok(Vec::new())
            }
            Message::Subscribe(subscribe) => self.handle_subscribe(session, subscribe),
            Message::Unsubscribe(unsubscribe) => self.handle_unsubscribe(session, unsubscribe),
            other => {
                warn!(conn = session.conn_id(), kind = other.type_code(), "unexpected message");
                Ok(Vec::new())
            }
        }
    }

    /// Tear down all state the connection held
    ///
    /// Tracking state always goes; subscriptions only when the session
    /// connected with the clean-session flag.
    pub fn connection_closed(&self, session: &Arc<Session>) {
        let index = session.index();
        self.registry.remove_session(session);
        if index != INVALID_INDEX {
            self.tracker.clean(index);
            if session.clean_session() {
                self.matcher.clean_session(index);
            }
        }
        info!(conn = session.conn_id(), index, "connection closed");
    }

    fn handle_connect(
        &self,
        session: &Arc<Session>,
        connect: Connect,
    ) -> Result<Vec<Action>, CoreError> {
        let Some(index) = self.identity.find_by_token(&connect.token) else {
            info!(conn = session.conn_id(), "connect rejected: unknown token");
            return Ok(vec![
                Action::Reply(Message::ConnAck(ConnAck::new(ConnectCode::NotAuthorized))),
                Action::Close,
            ]);
        };
        if index == INVALID_INDEX {
            return Ok(vec![
                Action::Reply(Message::ConnAck(ConnAck::new(ConnectCode::IdentifierRejected))),
                Action::Close,
            ]);
        }

        session.set_clean_session(connect.clean_session);
        if connect.clean_session {
            self.matcher.clean_session(index);
            self.tracker.clean(index);
        }

        let mut actions = vec![Action::Reply(Message::ConnAck(ConnAck::new(
            ConnectCode::Accepted,
        )))];
        if let Some(displaced) = self.registry.map_session(index, session, &[]) {
            warn!(index, old_conn = displaced.conn_id(), "session displaced by re-login");
            actions.push(Action::CloseConnection(displaced.conn_id()));
        }
        info!(conn = session.conn_id(), index, "session connected");
        Ok(actions)
    }

    fn handle_publish(
        &self,
        session: &Arc<Session>,
        publish: Publish,
    ) -> Result<Vec<Action>, CoreError> {
        validate_topic(&publish.topic)?;

        if publish.retain {
            self.matcher
                .retain(&publish.topic, publish.payload.clone(), publish.qos)?;
        }

        match publish.qos {
            QoS::AtMostOnce => {
                let mut actions = Vec::new();
                self.fan_out(&publish, &mut actions);
                Ok(actions)
            }
            QoS::AtLeastOnce => {
                let message_id = publish.message_id.ok_or(CoreError::MissingMessageId)?;
                let mut actions = Vec::new();
                self.fan_out(&publish, &mut actions);
                actions.push(Action::Reply(Message::PubAck(PubAck::new(message_id))));
                Ok(actions)
            }
            QoS::ExactlyOnce => {
                let message_id = publish.message_id.ok_or(CoreError::MissingMessageId)?;
                // Hold the payload until PUBREL releases it; a full pending
                // map is a delivery failure the publisher must see
                self.tracker
                    .register(session.index(), message_id, Message::Publish(publish))?;
                Ok(vec![Action::Reply(Message::PubRec(PubRec::new(message_id)))])
            }
        }
    }

    fn handle_pubrec(
        &self,
        session: &Arc<Session>,
        rec: PubRec,
    ) -> Result<Vec<Action>, CoreError> {
        let index = session.index();
        if !self.tracker.ack(index, rec.message_id) {
            return Ok(Vec::new());
        }
        // Second phase: the same id now tracks our PUBREL awaiting PUBCOMP
        let pubrel = PubRel::new(rec.message_id);
        self.tracker
            .register(index, rec.message_id, Message::PubRel(pubrel))?;
        Ok(vec![Action::Reply(Message::PubRel(pubrel))])
    }

    fn handle_pubrel(
        &self,
        session: &Arc<Session>,
        rel: PubRel,
    ) -> Result<Vec<Action>, CoreError> {
        let mut actions = Vec::new();
        match self.tracker.release(session.index(), rel.message_id) {
            Some(Message::Publish(publish)) => {
                // Exactly once: the entry is gone, a duplicate PUBREL
                // cannot re-forward
                self.fan_out(&publish, &mut actions);
            }
            Some(other) => {
                warn!(kind = other.type_code(), "released entry was not a publish");
            }
            None => {}
        }
        actions.push(Action::Reply(Message::PubComp(PubComp::new(rel.message_id))));
        Ok(actions)
    }

    fn handle_subscribe(
        &self,
        session: &Arc<Session>,
        subscribe: Subscribe,
    ) -> Result<Vec<Action>, CoreError> {
        let index = session.index();
        let mut granted = Vec::with_capacity(subscribe.filters.len());
        let mut retained_out = Vec::new();

        for (filter, requested) in &subscribe.filters {
            match self.matcher.subscribe(filter, index, *requested) {
                Ok(level) => {
                    granted.push(SubscribeReturn::Granted(level));
                    self.deliver_retained(index, filter, level, &mut retained_out);
                }
                Err(e) => {
                    warn!(conn = session.conn_id(), filter = %filter, %e, "subscription rejected");
                    granted.push(SubscribeReturn::Failure);
                }
            }
        }

        let mut actions = vec![Action::Reply(Message::SubAck(SubAck {
            request_id: subscribe.request_id,
            granted,
        }))];
        actions.append(&mut retained_out);
        Ok(actions)
    }

    /// Queue retained messages matching a fresh subscription
    fn deliver_retained(
        &self,
        index: SessionIndex,
        filter: &str,
        granted: QoS,
        actions: &mut Vec<Action>,
    ) {
        let retained = match self.matcher.matching_retained(filter) {
            Ok(retained) => retained,
            Err(_) => return,
        };
        for msg in retained {
            let qos = msg.qos.min(granted);
            let mut out = Publish::new(msg.topic, msg.payload, qos);
            out.retain = true;
            if qos != QoS::AtMostOnce {
                let id = self.tracker.next_message_id(index);
                out.message_id = Some(id);
                if let Err(e) = self
                    .tracker
                    .register(index, id, Message::Publish(out.clone()))
                {
                    warn!(index, %e, "dropping retained delivery");
                    continue;
                }
            }
            actions.push(Action::Reply(Message::Publish(out)));
        }
    }

    fn handle_unsubscribe(
        &self,
        session: &Arc<Session>,
        unsubscribe: Unsubscribe,
    ) -> Result<Vec<Action>, CoreError> {
        let index = session.index();
        for filter in &unsubscribe.filters {
            if let Err(e) = self.matcher.unsubscribe(filter, index) {
                warn!(conn = session.conn_id(), filter = %filter, %e, "unsubscribe ignored");
            }
        }
        Ok(vec![Action::Reply(Message::UnsubAck(UnsubAck {
            request_id: unsubscribe.request_id,
        }))])
    }

    /// Deliver a publish to every interested session
    ///
    /// A recipient with no live session, or whose pending map is full, is
    /// dropped without blocking delivery to the others.
    fn fan_out(&self, publish: &Publish, actions: &mut Vec<Action>) {
        for (subscriber, granted) in self.matcher.route(&publish.topic) {
            let dest = self
                .registry
                .find_by_index(subscriber)
                .or_else(|| self.registry.find_over_index(subscriber));
            let Some(dest) = dest else {
                debug!(subscriber, topic = %publish.topic, "no live session for subscriber");
                continue;
            };
            let dest_index = dest.index();
            if dest_index == INVALID_INDEX {
                continue;
            }

            let qos = publish.qos.min(granted);
            let mut out = Publish::new(publish.topic.clone(), publish.payload.clone(), qos);
            if qos != QoS::AtMostOnce {
                let id = self.tracker.next_message_id(dest_index);
                out.message_id = Some(id);
                if let Err(e) = self
                    .tracker
                    .register(dest_index, id, Message::Publish(out.clone()))
                {
                    warn!(dest_index, %e, "dropping delivery");
                    continue;
                }
            }
            actions.push(Action::Send {
                index: dest_index,
                message: Message::Publish(out),
            });
        }
    }
}
