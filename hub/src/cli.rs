use anyhow::Result;
use uuid::Uuid;

use crate::args::{
    CancelOperationArgs, GetClusterArgs, GetOperationArgs, HealthArgs, ListClustersArgs,
};
use crate::client::HubClient;
use crate::models::Operation;

/// Run the health CLI command.
pub async fn run_health(args: HealthArgs) -> Result<()> {
    let client = HubClient::from_endpoint(args.endpoint.as_deref());
    client.health().await?;
    println!("Hub is healthy");
    Ok(())
}

/// Run the list clusters CLI command.
pub async fn run_list_clusters(args: ListClustersArgs) -> Result<()> {
    let client = HubClient::from_endpoint(args.endpoint.as_deref());
    let page = client.list_clusters(args.limit, args.offset).await?;

    println!(
        "Clusters ({} of {}):",
        page.items.len(),
        page.full_count
    );
    for cluster in page.items {
        println!(
            "  {}  {:<12} {:<24} last_seen={}",
            cluster.id,
            cluster.status,
            cluster.name,
            cluster
                .last_seen_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        );
    }
    Ok(())
}

/// Run the get cluster CLI command.
pub async fn run_get_cluster(args: GetClusterArgs) -> Result<()> {
    let client = HubClient::from_endpoint(args.endpoint.as_deref());
    let id: Uuid = args.id.parse()?;
    let cluster = client.get_cluster(id).await?;

    println!("Cluster:");
    println!("  ID:         {}", cluster.id);
    println!("  Name:       {}", cluster.name);
    println!("  Status:     {}", cluster.status);
    println!("  Version:    {}", cluster.kubernetes_version);
    println!("  Platform:   {}", cluster.platform);
    println!("  Nodes:      {}", cluster.node_count);
    println!("  Region:     {}", cluster.region);
    println!(
        "  Last seen:  {}",
        cluster
            .last_seen_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );

    if args.operations {
        let page = client.list_operations(id, 20, 0).await?;
        println!("Recent operations:");
        for op in page.items {
            print_operation_line(&op);
        }
    }
    Ok(())
}

/// Run the get operation CLI command.
pub async fn run_get_operation(args: GetOperationArgs) -> Result<()> {
    let client = HubClient::from_endpoint(args.endpoint.as_deref());
    let id: Uuid = args.id.parse()?;
    let op = client.get_operation(id).await?;

    println!("Operation:");
    println!("  ID:       {}", op.id);
    println!("  Cluster:  {}", op.cluster_id);
    println!("  Type:     {}", op.op_type);
    println!("  Status:   {}", op.status);
    if !op.message.is_empty() {
        println!("  Message:  {}", op.message);
    }
    println!("  Created:  {}", op.created_at.to_rfc3339());
    if let Some(finished) = op.finished_at {
        println!("  Finished: {}", finished.to_rfc3339());
    }
    if let Some(result) = &op.result {
        println!(
            "  Result:   {}",
            serde_json::to_string(result).unwrap_or_default()
        );
    }
    Ok(())
}

/// Run the cancel operation CLI command.
pub async fn run_cancel_operation(args: CancelOperationArgs) -> Result<()> {
    let client = HubClient::from_endpoint(args.endpoint.as_deref());
    let id: Uuid = args.id.parse()?;
    client.cancel_operation(id).await?;
    println!("Operation {} cancelled", id);
    Ok(())
}

fn print_operation_line(op: &Operation) {
    println!(
        "  {}  {:<10} {:<16} {}",
        op.id,
        op.status,
        op.op_type,
        op.created_at.to_rfc3339(),
    );
}
