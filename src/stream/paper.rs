//! Push connector for the in-process paper venue.  Payloads are the model
//! types serialised as-is, under the same topic names Bybit uses.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Connection, PushChannel, PushConnector, RawMessage, StreamEvent, Topic, TopicKind};
use crate::exchange::paper::PaperVenue;
use crate::exchange::{AdapterError, AdapterResult};
use crate::models::{Account, AccountId, ExchangeKind};

pub struct PaperConnector {
    venue: Arc<PaperVenue>,
}

impl PaperConnector {
    pub fn new(venue: Arc<PaperVenue>) -> Self {
        Self { venue }
    }
}

#[async_trait]
impl PushConnector for PaperConnector {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Paper
    }

    async fn connect(&self, account: &Account) -> AdapterResult<Connection> {
        let inbound = self.venue.open_channel(account.id)?;
        Ok(Connection {
            channel: Box::new(PaperChannel {
                account_id: account.id,
                venue: self.venue.clone(),
            }),
            inbound,
        })
    }

    fn decode(&self, message: &RawMessage) -> AdapterResult<Vec<StreamEvent>> {
        let Some(kind) = TopicKind::from_wire_name(&message.topic) else {
            return Ok(Vec::new());
        };
        let data = message.data.clone();
        let event = match kind {
            TopicKind::OrderUpdate => StreamEvent::Orders(parse(data)?),
            TopicKind::Execution => StreamEvent::Executions(parse(data)?),
            TopicKind::Position => StreamEvent::Positions(parse(data)?),
            TopicKind::Wallet => StreamEvent::Wallet(parse(data)?),
            TopicKind::Ticker => {
                let quote: PaperQuote = parse(data)?;
                StreamEvent::Ticker {
                    market: quote.symbol,
                    bid: quote.bid,
                    ask: quote.ask,
                }
            }
        };
        Ok(vec![event])
    }
}

fn parse<T: for<'de> Deserialize<'de>>(data: serde_json::Value) -> AdapterResult<T> {
    serde_json::from_value(data).map_err(AdapterError::serialization)
}

#[derive(Deserialize)]
struct PaperQuote {
    symbol: String,
    bid: Option<f64>,
    ask: Option<f64>,
}

struct PaperChannel {
    account_id: AccountId,
    venue: Arc<PaperVenue>,
}

#[async_trait]
impl PushChannel for PaperChannel {
    async fn subscribe(&mut self, topics: &[Topic]) -> AdapterResult<()> {
        let names: Vec<String> = topics.iter().map(Topic::wire_name).collect();
        self.venue.set_channel_topics(self.account_id, "subscribe", &names)
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> AdapterResult<()> {
        self.venue
            .set_channel_topics(self.account_id, "unsubscribe", &[topic.wire_name()])
    }

    async fn close(&mut self) {
        self.venue.close_channel(self.account_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::ExchangeAdapter;
    use crate::models::{Credentials, OrderRequest, OrderSide};

    #[tokio::test]
    async fn test_fill_pushes_decode_in_order() {
        let venue = PaperVenue::new();
        venue.set_quote("BTCUSDT", Some(99.0), Some(101.0));
        let account = Account::new(
            "paper",
            ExchangeKind::Paper,
            Credentials {
                api_key: "k".into(),
                api_secret: "s".into(),
                testnet: true,
            },
        );
        let connector = PaperConnector::new(venue.clone());
        let mut conn = connector.connect(&account).await.unwrap();
        conn.channel.subscribe(&Topic::private_defaults()).await.unwrap();

        let exchange = PaperExchange::new(account.id, "k", venue.clone());
        exchange
            .open_order(&OrderRequest::market("BTCUSDT", OrderSide::Buy, 1.0))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(message) = conn.inbound.try_recv() {
            for event in connector.decode(&message).unwrap() {
                kinds.push(match event {
                    StreamEvent::Orders(_) => "orders",
                    StreamEvent::Executions(_) => "executions",
                    StreamEvent::Positions(_) => "positions",
                    StreamEvent::Wallet(_) => "wallet",
                    StreamEvent::Ticker { .. } => "ticker",
                });
            }
        }
        assert_eq!(kinds, vec!["orders", "executions", "orders", "positions", "wallet"]);
    }

    #[tokio::test]
    async fn test_unsubscribed_ticker_is_not_pushed() {
        let venue = PaperVenue::new();
        let account_id = uuid::Uuid::new_v4();
        let mut rx = venue.open_channel(account_id).unwrap();
        venue.set_quote("ETHUSDT", Some(1.0), Some(2.0));
        assert!(rx.try_recv().is_err());

        venue
            .set_channel_topics(account_id, "subscribe", &[Topic::ticker("ETHUSDT").wire_name()])
            .unwrap();
        venue.set_quote("ETHUSDT", Some(1.5), None);
        let message = rx.try_recv().unwrap();
        assert_eq!(message.topic, "tickers.ETHUSDT");
    }
}
