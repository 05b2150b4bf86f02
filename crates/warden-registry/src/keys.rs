/// Builds the namespaced registry key names from §3's data model. Every key
/// lives under a configured prefix `ns`, e.g. `ns:gh`, `ns:wz:br01`.
#[derive(Clone, Debug)]
pub struct KeyNames {
    ns: String,
}

impl KeyNames {
    pub fn new(ns: impl Into<String>) -> Self {
        Self { ns: ns.into() }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.ns, suffix)
    }

    pub fn gh(&self) -> String {
        self.key("gh")
    }

    pub fn wh(&self) -> String {
        self.key("wh")
    }

    pub fn bh(&self) -> String {
        self.key("bh")
    }

    pub fn rz(&self) -> String {
        self.key("rz")
    }

    pub fn cz(&self, cluster: &str) -> String {
        self.key(&format!("cz:{cluster}"))
    }

    pub fn bz(&self, cluster: &str) -> String {
        self.key(&format!("bz:{cluster}"))
    }

    pub fn wz(&self, broker_id: &str) -> String {
        self.key(&format!("wz:{broker_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_every_key() {
        let keys = KeyNames::new("test");
        assert_eq!(keys.gh(), "test:gh");
        assert_eq!(keys.wz("br01"), "test:wz:br01");
        assert_eq!(keys.cz("pvp"), "test:cz:pvp");
    }
}
