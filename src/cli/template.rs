use anyhow::{Context, Result};

const SERVER_TEMPLATE: &str = include_str!("../../demos/server.toml");
const CLIENT_TEMPLATE: &str = include_str!("../../demos/client.toml");

/// Generate configuration template
pub fn generate_config_template(template_type: &str, output: Option<&str>) -> Result<()> {
    let content = match template_type {
        "server" => SERVER_TEMPLATE,
        "client" => CLIENT_TEMPLATE,
        other => anyhow::bail!("Unknown template type: {}", other),
    };

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!(
            "Generated {} configuration template: {}",
            template_type, path
        );
    } else {
        println!("{}", content);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_templates_parse() {
        // 模板中的证书路径只需语法正确
        for template in [SERVER_TEMPLATE, CLIENT_TEMPLATE] {
            let config: Config = toml::from_str(template).unwrap();
            crate::config::ConfigValidator::validate_router(&config.router).unwrap();
        }
    }

    #[test]
    fn test_unknown_template() {
        assert!(generate_config_template("relay", None).is_err());
    }
}
