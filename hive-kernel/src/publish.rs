use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{info, warn};

use crate::aggregator::SnapshotHub;
use crate::config::MqttConf;
use crate::status::ServiceStatus;

/// Push MQTT du snapshot : publication retenue à chaque changement du hub,
/// pour qu'un abonné tardif reçoive immédiatement le dernier état.
pub fn spawn_snapshot_publisher(
    hub: SnapshotHub,
    conf: MqttConf,
    status: ServiceStatus,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut opts = MqttOptions::new("hive-kernel-snapshot", &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let mut rx = hub.subscribe();
        status.mark_mqtt_connecting();

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        info!("[publish] snapshot hub closed, stopping publisher");
                        break;
                    }
                    let snapshot = rx.borrow_and_update().clone();
                    match serde_json::to_vec(&*snapshot) {
                        Ok(payload) => {
                            if let Err(e) = client.publish(conf.topic.as_str(), QoS::AtLeastOnce, true, payload).await {
                                warn!("[publish] failed to publish snapshot: {:?}", e);
                            } else {
                                info!("[publish] snapshot {} -> {} ({} tasks, {}%)",
                                      snapshot.as_of, conf.topic, snapshot.tasks.len(), snapshot.progress_percent);
                            }
                        }
                        Err(e) => warn!("[publish] cannot encode snapshot: {}", e),
                    }
                },
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => status.mark_mqtt_connected(),
                        Ok(_) => {}
                        Err(e) => {
                            warn!("[publish] MQTT error: {:?}", e);
                            status.increment_reconnects();
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
    })
}
