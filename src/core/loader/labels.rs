use std::collections::HashMap;

/// Symbol name <-> address map populated by the loader, used by the
/// disassembler, the monitor `break` command and profile logging.
pub struct Labels {
    by_addr: HashMap<u32, String>,
}

impl Labels {
    pub fn new() -> Self {
        Labels {
            by_addr: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.by_addr.clear();
    }

    pub fn add(&mut self, addr: u32, name: &str) {
        self.by_addr.insert(addr, name.to_string());
    }

    pub fn get(&self, addr: u32) -> Option<&str> {
        self.by_addr.get(&addr).map(String::as_str)
    }

    pub fn find(&self, name: &str) -> Option<u32> {
        self.by_addr
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(a, _)| *a)
    }

    /// Resolve `name`, `name+off` or `name-off` to an address; 0 when the
    /// label does not exist.
    pub fn eval(&self, expr: &str) -> u32 {
        let (name, offset) = if let Some((n, off)) = expr.split_once('+') {
            (n, off.parse::<i64>().unwrap_or(0))
        } else if let Some((n, off)) = expr.split_once('-') {
            (n, -off.parse::<i64>().unwrap_or(0))
        } else {
            (expr, 0)
        };
        match self.find(name) {
            Some(addr) => (addr as i64 + offset) as u32,
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}
