/*!
# Hive Kernel - Protocole de coordination sur journal append-only

Les participants (leader + workers) ne se parlent jamais directement : leur seul
canal commun est le fil de commentaires d'un work item hébergé (issue GitHub).
Ce crate implémente tout ce qui se joue au-dessus de ce journal :

- `bus` : abstraction append/readAll/readSince + implémentations mémoire et GitHub
- `election` : élection du leader par fenêtre de stabilisation
- `health` : liveness dérivée du dernier message de chaque participant
- `tasks` : publication des tâches et claims optimistes
- `reassign` : republication des tâches orphelines par le leader
- `aggregator` : projection du journal en `SystemSnapshot`
- `participant` : boucle coopérative d'un participant (leader ou worker)
*/

pub mod aggregator;
pub mod bus;
pub mod clock;
pub mod config;
pub mod context;
pub mod election;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod message;
pub mod participant;
pub mod planner;
pub mod publish;
pub mod reassign;
pub mod status;
pub mod tasks;

pub use aggregator::{Aggregator, SnapshotBuilder, SnapshotHub, SystemSnapshot};
pub use bus::{BusError, MemoryBus, MessageBus, SharedBus};
pub use clock::{Clock, SharedClock, SystemClock, TokioClock};
pub use config::HiveConfig;
pub use context::{Candidate, ParticipantContext};
pub use error::{HiveError, Result};
pub use lifecycle::{ParticipantStatus, TaskStatus};
pub use message::{LogPosition, Message, MessageBody, MessageKind, Role};
