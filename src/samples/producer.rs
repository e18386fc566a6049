//! Producer sample
//!
//! Walks through every send mode of the `Producer` and prints the results.

use std::time::Duration;

use serde_json::json;

use crate::broker::message::{Headers, MessageEnvelope};
use crate::client::producer::Producer;
use crate::utils::Result;

pub const TOPIC: &str = "topic";

/// Partition key used by the ordered sample.
pub const ORDER_KEY: &str = "2673";

pub struct SampleProducer {
    producer: Producer,
}

impl SampleProducer {
    pub fn new(producer: Producer) -> Self {
        Self { producer }
    }

    /// Reliable synchronous send, waits up to 10s for the broker.
    pub async fn sync_send(&self) -> Result<()> {
        let message = MessageEnvelope::new("springboot-topic:tag", "a synchronous message")?;
        let result = self
            .producer
            .send_sync(message, Duration::from_secs(10))
            .await?;
        println!("{result}");
        Ok(())
    }

    /// Reliable asynchronous send; the result arrives on a callback.
    pub fn async_send(&self) -> Result<()> {
        let message = MessageEnvelope::new("springboot-topic:tag1", "an asynchronous message")?;
        self.producer.send_async(
            message,
            |result| println!("callback send result: {result}"),
            |err| println!("{err}"),
        );
        Ok(())
    }

    pub fn send_one_way(&self) -> Result<()> {
        let message = MessageEnvelope::new("springboot-topic:tag1", "a one-way message")?;
        self.producer.send_one_way(message);
        Ok(())
    }

    /// Twenty one-way messages sharing one partition key, consumed in order.
    pub fn send_one_way_orderly(&self) -> Result<()> {
        for i in 0..10 {
            for _ in 0..2 {
                let message =
                    MessageEnvelope::new("springboot-topic:tag1", format!("an ordered message {i}"))?;
                self.producer.send_one_way_ordered(message, ORDER_KEY);
            }
        }
        Ok(())
    }

    /// Level 4 of the delay ladder: 30 seconds.
    pub fn send_delay(&self) -> Result<()> {
        let message = MessageEnvelope::new("topic-delay", "a delayed message")?.with_delay_level(4)?;
        self.producer.send_async_with_timeout(
            message,
            Duration::from_millis(100),
            |_result| {},
            |_err| {},
        );
        Ok(())
    }

    /// Payload conversion, tags, user properties and a post-processor.
    pub async fn convert_and_send(&self) -> Result<()> {
        let producer = &self.producer;

        producer.convert_and_send(TOPIC, "tag null").await?;
        // a tag is either a value or absent, never empty
        if let Err(err) = producer.convert_and_send(&format!("{TOPIC}:"), "tag empty ?").await {
            println!("rejected: {err}");
        }
        producer.convert_and_send(&format!("{TOPIC}:a"), "tag a").await?;
        producer.convert_and_send(&format!("{TOPIC}:b"), "tag b").await?;

        let mut properties = Headers::new();
        properties.insert("property".to_string(), json!(1));
        properties.insert("another-property".to_string(), json!("hello"));
        producer
            .convert_and_send_with_headers(TOPIC, "property 1", properties.clone())
            .await?;
        producer
            .convert_and_send_with_headers(&format!("{TOPIC}:a"), "tag a property 1", properties.clone())
            .await?;
        producer
            .convert_and_send_with_headers(&format!("{TOPIC}:b"), "tag b property 1", properties.clone())
            .await?;

        properties.insert("property".to_string(), json!(5));
        producer
            .convert_and_send_with_headers(TOPIC, "property 5", properties.clone())
            .await?;
        producer
            .convert_and_send_with_headers(&format!("{TOPIC}:a"), "tag a property 5", properties.clone())
            .await?;
        producer
            .convert_and_send_with_headers(&format!("{TOPIC}:c"), "tag c property 5", properties)
            .await?;

        producer
            .convert_and_send_with(TOPIC, "post-processed message", None, |message| {
                message.with_header("post-processed", true)
            })
            .await?;
        Ok(())
    }

    pub async fn run_all(&self) -> Result<()> {
        self.sync_send().await?;
        self.async_send()?;
        self.send_one_way()?;
        self.send_one_way_orderly()?;
        self.send_delay()?;
        self.convert_and_send().await
    }
}
