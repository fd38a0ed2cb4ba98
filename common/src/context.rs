use kube::{client::Client, runtime::events::Reporter};

fn get_prog_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_name()?
        .to_str()?
        .to_owned()
        .into()
}

pub fn get_client_name() -> String {
    match get_prog_name() {
        None => "mqtt.solidite.fr".to_string(),
        Some(p) => {
            if p == "operator" {
                "controller.mqtt.solidite.fr".to_string()
            } else {
                "mqtt.solidite.fr".to_string()
            }
        }
    }
}
pub fn get_short_name() -> String {
    let long = get_client_name();
    let lst = long.split(".").collect::<Vec<&str>>();
    if lst.len() > 3 {
        format!("{}-{}", lst[1], lst[0])
    } else {
        "mqtt".to_string()
    }
}

pub async fn get_client_async() -> crate::Result<Client> {
    Client::try_default().await.map_err(crate::Error::KubeError)
}
pub fn get_reporter() -> Reporter {
    Reporter {
        controller: get_short_name(),
        instance: Some(std::env::var("POD_NAME").unwrap_or_else(|_| "unknown".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_is_derived_from_client_name() {
        // test binaries are never named "operator"
        assert_eq!(get_client_name(), "mqtt.solidite.fr");
        assert_eq!(get_short_name(), "mqtt");
    }
}
