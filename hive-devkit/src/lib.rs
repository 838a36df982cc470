/*!
# Hive DevKit - Stubs et utilitaires de test du protocole

Bibliothèque facilitant l'écriture de tests multi-participants sans GitHub :
- `FlakyBus` : bus mémoire avec pannes transitoires et visibilité retardée
- `ScenarioBuilder` : journaux à positions et horodatages imposés
- `TestHarness` : bus partagé + horloge tokio pour lancer plusieurs participants
- `ScriptedRunner` : exécuteur de tâches au déroulé scripté
*/

pub mod builders;
pub mod bus_stub;
pub mod test_utils;

pub use builders::{spec, ScenarioBuilder};
pub use bus_stub::FlakyBus;
pub use test_utils::{ScriptedRunner, TestHarness};
