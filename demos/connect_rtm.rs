use std::error::Error;

use secrecy::SecretString;
use slack_rtm::rtm::events::RtmEvent;
use slack_rtm::rtm::manager::{RtmManager, RtmOptions};
use slack_rtm::web_api::WebApiClient;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("SLACK_TOKEN").unwrap_or_else(|_| "REPLACE_WITH_BOT_TOKEN".to_string());
    let channel = std::env::var("SLACK_CHANNEL").unwrap_or_else(|_| "REPLACE_WITH_CHANNEL_ID".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = WebApiClient::new(SecretString::new(token))?;
        let (rtm, mut events) = RtmManager::websocket(client, RtmOptions::default());
        rtm.connect()?;

        while let Some(event) = events.recv().await {
            match event {
                RtmEvent::Connected {
                    connection_count,
                    info,
                } => {
                    println!(
                        "connected team={} user={} connection_count={connection_count}",
                        info.team.domain, info.user.name
                    );
                }
                RtmEvent::Hello => {
                    let delivery = rtm
                        .send(rtm.new_outgoing_message("hello from slack-rtm", channel.clone()))
                        .await?;
                    println!("queued message id={}", delivery.id());
                }
                RtmEvent::Ack(ack) => {
                    println!("acked reply_to={} ts={:?}", ack.reply_to, ack.ts);
                    break;
                }
                RtmEvent::Message(message) => {
                    println!("#{} <{}> {}", message.channel, message.user, message.text);
                }
                RtmEvent::LatencyReport { latency } => {
                    println!("latency={latency:?}");
                }
                RtmEvent::InvalidAuth { code } => {
                    eprintln!("rejected: {code}");
                }
                RtmEvent::Disconnected { intentional, cause } => {
                    println!("disconnected intentional={intentional} cause={cause}");
                }
                event if event.is_lifecycle() => println!("lifecycle event={}", event.kind()),
                _ => {}
            }
        }

        rtm.disconnect().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
