/// One of the eight atomic server-side scripts. Each is embedded Lua source
/// evaluated with a fixed key list and string arguments, returning a tagged
/// array `[code, ...]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScriptId {
    Join,
    PickBroker,
    FindOrCreate,
    FindBroker,
    HealthCheck,
    Salvage,
    FetchForRecovery,
    DestroyWorker,
}

impl ScriptId {
    pub const ALL: [ScriptId; 8] = [
        ScriptId::Join,
        ScriptId::PickBroker,
        ScriptId::FindOrCreate,
        ScriptId::FindBroker,
        ScriptId::HealthCheck,
        ScriptId::Salvage,
        ScriptId::FetchForRecovery,
        ScriptId::DestroyWorker,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ScriptId::Join => "join",
            ScriptId::PickBroker => "pickBroker",
            ScriptId::FindOrCreate => "findOrCreate",
            ScriptId::FindBroker => "findBroker",
            ScriptId::HealthCheck => "healthCheck",
            ScriptId::Salvage => "salvage",
            ScriptId::FetchForRecovery => "fetchForRecovery",
            ScriptId::DestroyWorker => "destroyWorker",
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            ScriptId::Join => include_str!("scripts/join.lua"),
            ScriptId::PickBroker => include_str!("scripts/pick_broker.lua"),
            ScriptId::FindOrCreate => include_str!("scripts/find_or_create.lua"),
            ScriptId::FindBroker => include_str!("scripts/find_broker.lua"),
            ScriptId::HealthCheck => include_str!("scripts/health_check.lua"),
            ScriptId::Salvage => include_str!("scripts/salvage.lua"),
            ScriptId::FetchForRecovery => include_str!("scripts/fetch_for_recovery.lua"),
            ScriptId::DestroyWorker => include_str!("scripts/destroy_worker.lua"),
        }
    }
}
