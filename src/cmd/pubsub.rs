use bytes::Bytes;

use crate::frame::Frame;
use crate::state::ServerState;

use super::parse::{Parse, ParseError};
use super::{CommandError, Session};

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    channels: Vec<Bytes>,
}

/// With no channels, unsubscribes from all of them.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    channels: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PSubscribe {
    patterns: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PUnsubscribe {
    patterns: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    channel: Bytes,
    message: Bytes,
}

fn names(parse: &mut Parse) -> Result<Vec<Bytes>, CommandError> {
    let mut names = vec![];
    loop {
        match parse.next_bytes() {
            Ok(name) => names.push(name),
            Err(ParseError::EndOfStream) => return Ok(names),
            Err(err) => return Err(err.into()),
        }
    }
}

/// `[kind, name, count]`, the confirmation sent for each (un)subscription.
fn confirmation(kind: &'static str, name: Option<Bytes>, count: usize) -> Frame {
    Frame::Array(vec![
        Frame::bulk(kind),
        Frame::bulk_or_nil(name),
        Frame::Integer(count as i64),
    ])
}

impl Subscribe {
    pub fn new(channels: Vec<Bytes>) -> Subscribe {
        Subscribe { channels }
    }

    pub fn into_frame(self) -> Frame {
        Frame::command(std::iter::once(Bytes::from("SUBSCRIBE")).chain(self.channels))
    }

    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Subscribe, CommandError> {
        Ok(Subscribe {
            channels: names(parse)?,
        })
    }

    pub(crate) fn apply(self, session: &mut Session, state: &ServerState) -> Vec<Frame> {
        session.enter_subscribed();

        let id = session.subscriber_id();
        let mut replies = Vec::with_capacity(self.channels.len());

        for channel in self.channels {
            if session.channels().insert(channel.clone()) {
                state.pubsub.subscribe(id, channel.clone(), session.messages());
            }
            replies.push(confirmation("subscribe", Some(channel), session.subscription_count()));
        }

        replies
    }
}

impl Unsubscribe {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Unsubscribe, CommandError> {
        Ok(Unsubscribe {
            channels: names(parse)?,
        })
    }

    pub(crate) fn apply(self, session: &mut Session, state: &ServerState) -> Vec<Frame> {
        let id = session.subscriber_id();
        let channels = if self.channels.is_empty() {
            session.channels().iter().cloned().collect()
        } else {
            self.channels
        };

        if channels.is_empty() {
            return vec![confirmation("unsubscribe", None, session.subscription_count())];
        }

        channels
            .into_iter()
            .map(|channel| {
                if session.channels().remove(&channel) {
                    state.pubsub.unsubscribe(id, &channel);
                }
                confirmation("unsubscribe", Some(channel), session.subscription_count())
            })
            .collect()
    }
}

impl PSubscribe {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<PSubscribe, CommandError> {
        Ok(PSubscribe {
            patterns: names(parse)?,
        })
    }

    pub(crate) fn apply(self, session: &mut Session, state: &ServerState) -> Vec<Frame> {
        session.enter_subscribed();

        let id = session.subscriber_id();
        let mut replies = Vec::with_capacity(self.patterns.len());

        for pattern in self.patterns {
            if session.patterns().insert(pattern.clone()) {
                state.pubsub.psubscribe(id, pattern.clone(), session.messages());
            }
            replies.push(confirmation("psubscribe", Some(pattern), session.subscription_count()));
        }

        replies
    }
}

impl PUnsubscribe {
    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<PUnsubscribe, CommandError> {
        Ok(PUnsubscribe {
            patterns: names(parse)?,
        })
    }

    pub(crate) fn apply(self, session: &mut Session, state: &ServerState) -> Vec<Frame> {
        let id = session.subscriber_id();
        let patterns = if self.patterns.is_empty() {
            session.patterns().iter().cloned().collect()
        } else {
            self.patterns
        };

        if patterns.is_empty() {
            return vec![confirmation("punsubscribe", None, session.subscription_count())];
        }

        patterns
            .into_iter()
            .map(|pattern| {
                if session.patterns().remove(&pattern) {
                    state.pubsub.punsubscribe(id, &pattern);
                }
                confirmation("punsubscribe", Some(pattern), session.subscription_count())
            })
            .collect()
    }
}

impl Publish {
    pub fn new(channel: impl Into<Bytes>, message: impl Into<Bytes>) -> Publish {
        Publish {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::command([Bytes::from("PUBLISH"), self.channel, self.message])
    }

    pub(crate) fn parse_frames(parse: &mut Parse) -> Result<Publish, CommandError> {
        Ok(Publish {
            channel: parse.next_bytes()?,
            message: parse.next_bytes()?,
        })
    }

    pub(crate) fn apply(self, state: &ServerState) -> Frame {
        Frame::Integer(state.pubsub.publish(&self.channel, &self.message) as i64)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::cmd::Mode;
    use crate::config::Config;
    use crate::replication::Role;

    #[test]
    fn publish_reaches_channel_and_pattern_subscribers() {
        let state = ServerState::new(Config::new(), Role::Master);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(state.pubsub.next_id(), tx);

        Subscribe::new(vec![Bytes::from("news")]).apply(&mut session, &state);
        let replies = PSubscribe {
            patterns: vec![Bytes::from("n*")],
        }
        .apply(&mut session, &state);
        assert_eq!(
            replies,
            vec![Frame::Array(vec![
                Frame::bulk("psubscribe"),
                Frame::bulk("n*"),
                Frame::Integer(2),
            ])]
        );
        assert_eq!(session.mode(), Mode::Subscribed);

        assert_eq!(Publish::new("news", "hi").apply(&state), Frame::Integer(2));
        assert_eq!(rx.try_recv().unwrap(), Frame::command(["message", "news", "hi"]));
        assert_eq!(
            rx.try_recv().unwrap(),
            Frame::command(["pmessage", "n*", "news", "hi"])
        );
    }

    #[test]
    fn unsubscribe_everything() {
        let state = ServerState::new(Config::new(), Role::Master);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(state.pubsub.next_id(), tx);

        Subscribe::new(vec![Bytes::from("a"), Bytes::from("b")]).apply(&mut session, &state);

        let replies = Unsubscribe { channels: vec![] }.apply(&mut session, &state);
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[1],
            Frame::Array(vec![Frame::bulk("unsubscribe"), Frame::bulk("b"), Frame::Integer(0)])
        );
        assert_eq!(Publish::new("a", "x").apply(&state), Frame::Integer(0));

        let none = Unsubscribe { channels: vec![] }.apply(&mut session, &state);
        assert_eq!(
            none,
            vec![Frame::Array(vec![Frame::bulk("unsubscribe"), Frame::NullBulk, Frame::Integer(0)])]
        );
    }
}
