fn main() -> anyhow::Result<()> {
    stitch_gateway::main()
}
