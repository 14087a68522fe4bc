use crate::ProcessTarget;

pub const DEFAULT_FRONTEND_PORT_BASE: u16 = 5100;
pub const DEFAULT_BACKEND_PORT_BASE: u16 = 5500;

/// Conventional dev-server port for a framework, used when nothing is stored.
pub fn default_port_for_framework(target: ProcessTarget, framework: Option<&str>) -> Option<u16> {
    let framework = framework?.trim().to_ascii_lowercase();
    let port = match (target, framework.as_str()) {
        (ProcessTarget::Frontend, "vite" | "react" | "vue" | "svelte" | "solid" | "preact") => 5173,
        (ProcessTarget::Frontend, "nextjs" | "next") => 3000,
        (ProcessTarget::Frontend, "angular") => 4200,
        (ProcessTarget::Backend, "express" | "node" | "nestjs" | "fastify") => 3000,
        (ProcessTarget::Backend, "flask") => 5000,
        (ProcessTarget::Backend, "fastapi" | "django") => 8000,
        _ => return None,
    };
    Some(port)
}

/// Parses a comma/whitespace separated list, skipping anything unparsable.
pub fn parse_list<T: std::str::FromStr>(raw: &str) -> Vec<T> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|part| part.trim().parse::<T>().ok())
        .collect()
}
