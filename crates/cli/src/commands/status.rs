use margin_core::db::repository::{
    ApplicationInstanceRepository, GroupingRepository, LmsCourseRepository,
};
use margin_core::models::grouping::GroupingType;
use tracing::info;

use super::open;

const GROUPING_TYPES: [GroupingType; 6] = [
    GroupingType::Course,
    GroupingType::CanvasSection,
    GroupingType::CanvasGroup,
    GroupingType::BlackboardGroup,
    GroupingType::D2lGroup,
    GroupingType::MoodleGroup,
];

/// Run the `status` command: show tenants and stored records.
pub async fn run(config_path: &str) -> anyhow::Result<()> {
    let (config, repo) = open(config_path).await?;
    info!("Loaded configuration from {}", config_path);

    let db_path = config.margin.database.path.clone().unwrap_or_default();
    let db_size = std::fs::metadata(&db_path)
        .map(|m| format_bytes(m.len()))
        .unwrap_or_else(|_| "unknown".to_string());

    println!("margin Status");
    println!("=============");
    println!("Instance:   {}", config.margin.instance_name);
    println!(
        "Public URL: {}",
        config.margin.public_url.as_deref().unwrap_or("(not set)")
    );
    println!("Annotation: {} ({})", config.h.api_url, config.h.authority);
    println!("Database:   SQLite {} ({})", db_path, db_size);
    println!();

    println!("Records");
    println!("-------");
    println!(
        "Tenants:      {}",
        repo.count_application_instances().await?
    );
    println!("LMS courses:  {}", repo.count_lms_courses().await?);
    for grouping_type in GROUPING_TYPES {
        let count = repo.count_groupings(grouping_type).await?;
        if count > 0 || grouping_type == GroupingType::Course {
            println!("{:<13} {}", format!("{}:", grouping_type.as_str()), count);
        }
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_displays_correctly() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
        assert_eq!(format_bytes(1073741824), "1.0 GB");
    }
}
