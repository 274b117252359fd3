use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::registry::Catalogue;
use super::schema::{ParamSchema, ParamType};
use super::{f64_arg, u64_arg, Arguments, HandlerError, ToolDescriptor, ToolHandler};
use crate::entity::{EntityId, Position};
use crate::error::{ToolError, ToolResult};
use crate::genome::TraitSet;
use crate::world::{SimWorld, SpawnSpec, WorldCommand};

pub const CATEGORY: &str = "ecs";
const DEFAULT_MATE_LIMIT: u64 = 5;

#[derive(Debug, Clone, Copy)]
enum AgentOp {
    Spawn,
    Remove,
    Breed,
    Get,
    List,
    Positions,
    Status,
    Accelerate,
    Nudge,
    Compatibility,
    Mates,
    Lineage,
}

struct AgentTool {
    world: Arc<SimWorld>,
    op: AgentOp,
}

fn agent_id(args: &Arguments, name: &str) -> Result<EntityId, HandlerError> {
    Ok(EntityId::from_raw(u64_arg(args, name)?))
}

fn view(world: &SimWorld, id: EntityId) -> Result<Value, HandlerError> {
    let agent = world
        .read(|s| s.agent(id))
        .ok_or_else(|| ToolError::NotFound(format!("agent {}", id.to_raw())))?;
    Ok(serde_json::to_value(agent)?)
}

fn spawn_spec(args: &Arguments) -> Result<SpawnSpec, HandlerError> {
    let traits = match args.get("traits") {
        Some(Value::Object(map)) => {
            let mut values = Vec::with_capacity(map.len());
            for (name, v) in map {
                let value = v
                    .as_f64()
                    .ok_or_else(|| format!("trait '{}' must be a number", name))?;
                values.push((name.clone(), value));
            }
            Some(TraitSet::from_values(values))
        }
        _ => None,
    };
    let position = match (
        args.get("x").and_then(Value::as_f64),
        args.get("y").and_then(Value::as_f64),
    ) {
        (Some(x), Some(y)) => Some(Position { x, y }),
        _ => None,
    };
    Ok(SpawnSpec {
        name: args.get("name").and_then(Value::as_str).map(str::to_string),
        traits,
        position,
    })
}

#[async_trait]
impl ToolHandler for AgentTool {
    async fn call(&self, args: Arguments) -> Result<Value, HandlerError> {
        let world = &self.world;
        let value = match self.op {
            AgentOp::Spawn => {
                let id = world.execute(WorldCommand::Spawn(spawn_spec(&args)?)).await?;
                view(world, id)?
            }
            AgentOp::Remove => {
                let id = world.execute(WorldCommand::Remove(agent_id(&args, "agent_id")?)).await?;
                json!({ "removed": id.to_raw() })
            }
            AgentOp::Breed => {
                let a = agent_id(&args, "parent_a")?;
                let b = agent_id(&args, "parent_b")?;
                let child = world.execute(WorldCommand::Breed(a, b)).await?;
                view(world, child)?
            }
            AgentOp::Get => view(world, agent_id(&args, "agent_id")?)?,
            AgentOp::List => {
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|l| l as usize)
                    .unwrap_or(usize::MAX);
                let agents = world.read(|s| s.agents());
                let total = agents.len();
                let agents: Vec<_> = agents.into_iter().take(limit).collect();
                json!({ "agents": agents, "total": total })
            }
            AgentOp::Positions => {
                let positions: Vec<Value> = world
                    .read(|s| s.positions())
                    .into_iter()
                    .map(|(id, p)| json!({ "id": id, "x": p.x, "y": p.y }))
                    .collect();
                json!({ "positions": positions })
            }
            AgentOp::Status => serde_json::to_value(world.status())?,
            AgentOp::Accelerate => {
                let applied = world.set_acceleration(f64_arg(&args, "factor")?)?;
                json!({ "acceleration": applied })
            }
            AgentOp::Nudge => {
                let amount = f64_arg(&args, "amount")?;
                if !amount.is_finite() || amount <= 0.0 {
                    return Err(ToolError::Validation("amount must be positive".into()).into());
                }
                world.nudge(amount);
                json!({ "queued": amount })
            }
            AgentOp::Compatibility => {
                let a = agent_id(&args, "agent_a")?;
                let b = agent_id(&args, "agent_b")?;
                let (score, threshold) =
                    world.read(|s| s.compatibility(a, b).map(|c| (c, s.params().compatibility_threshold)))?;
                json!({
                    "compatibility": score,
                    "threshold": threshold,
                    "compatible": score >= threshold,
                })
            }
            AgentOp::Mates => {
                let id = agent_id(&args, "agent_id")?;
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_MATE_LIMIT) as usize;
                let mates = world.read(|s| s.compatible_mates(id, limit))?;
                json!({ "mates": mates })
            }
            AgentOp::Lineage => {
                let id = agent_id(&args, "agent_id")?;
                world.read(|s| s.lineage(id))?
            }
        };
        Ok(value)
    }
}

/// Register the tools that read or mutate the agent world.
pub fn register_agent_tools(catalogue: &Catalogue, world: &Arc<SimWorld>) -> ToolResult<()> {
    let id_param = |name: &str| ParamSchema::new().required(name, ParamType::Integer, "Agent id");
    let pair = |a: &str, b: &str| {
        ParamSchema::new()
            .required(a, ParamType::Integer, "First agent id")
            .required(b, ParamType::Integer, "Second agent id")
    };
    let tools = [
        (
            "spawn_agent",
            "Create a generation-0 agent",
            AgentOp::Spawn,
            ParamSchema::new()
                .optional("name", ParamType::String, "Display name")
                .optional("traits", ParamType::Object, "Trait name to value in [0, 1]")
                .optional("x", ParamType::Number, "Initial x")
                .optional("y", ParamType::Number, "Initial y"),
        ),
        ("remove_agent", "Remove an agent", AgentOp::Remove, id_param("agent_id")),
        ("create_offspring", "Breed two agents", AgentOp::Breed, pair("parent_a", "parent_b")),
        ("get_agent", "Show one agent", AgentOp::Get, id_param("agent_id")),
        (
            "list_agents",
            "List agents in creation order",
            AgentOp::List,
            ParamSchema::new().optional("limit", ParamType::Integer, "Maximum agents returned"),
        ),
        ("get_agent_positions", "Positions of all agents", AgentOp::Positions, ParamSchema::new()),
        ("get_simulation_status", "World clock and population", AgentOp::Status, ParamSchema::new()),
        (
            "accelerate_time",
            "Set the time acceleration factor",
            AgentOp::Accelerate,
            ParamSchema::new().required("factor", ParamType::Number, "Positive factor"),
        ),
        (
            "nudge_time",
            "Advance simulated time on the next tick",
            AgentOp::Nudge,
            ParamSchema::new().required("amount", ParamType::Number, "Simulated seconds"),
        ),
        ("analyze_compatibility", "Compatibility of two agents", AgentOp::Compatibility, pair("agent_a", "agent_b")),
        (
            "find_compatible_mates",
            "Agents compatible with the given one, best first",
            AgentOp::Mates,
            id_param("agent_id").optional("limit", ParamType::Integer, "Maximum candidates"),
        ),
        ("get_lineage", "Parents and children of an agent", AgentOp::Lineage, id_param("agent_id")),
    ];

    for (name, description, op, schema) in tools {
        catalogue.register(
            ToolDescriptor::local(name, CATEGORY, description).with_schema(schema),
            Some(Arc::new(AgentTool {
                world: world.clone(),
                op,
            })),
            false,
        )?;
    }
    Ok(())
}
